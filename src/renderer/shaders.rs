use anyhow::{anyhow, bail, Context, Result};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

use super::backend::{ProgramId, ProgramKind, RenderBackend};

const MAX_INCLUDE_DEPTH: usize = 8;

const EMBEDDED: [(&str, &str); 5] = [
    ("shadow_depth.wgsl", include_str!("../../assets/shaders/shadow_depth.wgsl")),
    ("shadow_lit.wgsl", include_str!("../../assets/shaders/shadow_lit.wgsl")),
    ("screen.wgsl", include_str!("../../assets/shaders/screen.wgsl")),
    ("debug_depth.wgsl", include_str!("../../assets/shaders/debug_depth.wgsl")),
    ("fullscreen.wgsl", include_str!("../../assets/shaders/fullscreen.wgsl")),
];

pub fn embedded_source(file: &str) -> Option<&'static str> {
    EMBEDDED.iter().find(|(name, _)| *name == file).map(|(_, source)| *source)
}

/// Expands `#include "file"` lines through `resolve`.
///
/// Unresolvable or malformed directives are logged and dropped. Files already being expanded
/// and nesting deeper than the include limit are skipped the same way.
pub fn preprocess_source<F>(source: &str, resolve: &mut F) -> String
where
    F: FnMut(&str) -> Result<String>,
{
    let mut stack = Vec::new();
    expand(source, resolve, &mut stack)
}

fn expand<F>(source: &str, resolve: &mut F, stack: &mut Vec<String>) -> String
where
    F: FnMut(&str) -> Result<String>,
{
    let mut out = String::with_capacity(source.len());
    for line in source.lines() {
        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix("#include") else {
            out.push_str(line);
            out.push('\n');
            continue;
        };
        let file = match parse_include_target(rest) {
            Ok(file) => file,
            Err(err) => {
                log::error!("Shader include directive '{trimmed}' ignored: {err}");
                continue;
            }
        };
        if stack.len() >= MAX_INCLUDE_DEPTH || stack.iter().any(|open| open == file) {
            log::error!("Shader include '{file}' skipped: recursive or nested too deeply");
            continue;
        }
        match resolve(file) {
            Ok(included) => {
                stack.push(file.to_string());
                out.push_str(&expand(&included, resolve, stack));
                stack.pop();
            }
            Err(err) => log::error!("Shader include '{file}' could not be loaded: {err:#}"),
        }
    }
    out
}

fn parse_include_target(rest: &str) -> Result<&str> {
    let rest = rest.trim();
    let inner = rest
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .ok_or_else(|| anyhow!("expected a quoted file name"))?;
    if inner.is_empty() || inner.contains('"') {
        bail!("expected a single quoted file name");
    }
    Ok(inner)
}

struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
}

impl ShaderWatcher {
    fn new(dir: &Path) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher
            .configure(
                NotifyConfig::default()
                    .with_compare_contents(false)
                    .with_poll_interval(Duration::from_millis(300)),
            )
            .context("configure shader watcher")?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", dir.display()))?;
        Ok(Self { _watcher: watcher, rx })
    }

    fn drain_changes(&self) -> Vec<PathBuf> {
        let mut changes = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            match event {
                Ok(event) if is_relevant(&event.kind) => changes.extend(event.paths),
                Ok(_) => {}
                Err(err) => log::warn!("Shader watcher error: {err}"),
            }
        }
        changes
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Create(_)
    )
}

#[derive(Debug, Clone)]
struct ProgramSlot {
    program: ProgramId,
    /// Every file that contributed to the current source, the program's own file first.
    files: Vec<String>,
}

/// Owns the one program per named pass, their sources and their reload policy.
pub struct ShaderLibrary {
    source_dir: Option<PathBuf>,
    slots: HashMap<ProgramKind, ProgramSlot>,
    watcher: Option<ShaderWatcher>,
}

impl ShaderLibrary {
    /// Sources compiled into the binary; nothing to reload.
    pub fn embedded() -> Self {
        Self { source_dir: None, slots: HashMap::new(), watcher: None }
    }

    /// Sources read from `dir`, watched for edits when the platform allows it.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            bail!("Shader directory '{}' does not exist", dir.display());
        }
        let watcher = match ShaderWatcher::new(&dir) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                log::warn!("Shader hot reload disabled for {}: {err:#}", dir.display());
                None
            }
        };
        Ok(Self { source_dir: Some(dir), slots: HashMap::new(), watcher })
    }

    pub fn source_dir(&self) -> Option<&Path> {
        self.source_dir.as_deref()
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn program(&self, kind: ProgramKind) -> ProgramId {
        self.slots.get(&kind).map(|slot| slot.program).unwrap_or(ProgramId::INVALID)
    }

    /// Preprocessed source for `kind` plus the files it was assembled from.
    pub fn load_source(&self, kind: ProgramKind) -> Result<(String, Vec<String>)> {
        let root = self.read_file(kind.file_name())?;
        let mut files = vec![kind.file_name().to_string()];
        let source = preprocess_source(&root, &mut |file: &str| {
            let text = self.read_file(file)?;
            files.push(file.to_string());
            Ok(text)
        });
        Ok((source, files))
    }

    fn read_file(&self, file: &str) -> Result<String> {
        match &self.source_dir {
            Some(dir) => {
                let path = dir.join(file);
                fs::read_to_string(&path).with_context(|| format!("Failed to read shader {}", path.display()))
            }
            None => embedded_source(file)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("No embedded shader named '{file}'")),
        }
    }

    /// Builds every program. Failures leave [`ProgramId::INVALID`] in that slot.
    pub fn compile_all<B: RenderBackend>(&mut self, backend: &mut B) {
        for kind in ProgramKind::ALL {
            match self.build(backend, kind) {
                Ok(slot) => {
                    log::info!("Compiled shader '{}'", kind.name());
                    self.slots.insert(kind, slot);
                }
                Err(err) => {
                    log::error!("Shader '{}' failed to compile: {err:#}", kind.name());
                    self.slots
                        .insert(kind, ProgramSlot { program: ProgramId::INVALID, files: vec![kind.file_name().into()] });
                }
            }
        }
    }

    /// Rebuilds one program, keeping the previous one if the new source fails.
    pub fn reload<B: RenderBackend>(&mut self, backend: &mut B, kind: ProgramKind) -> bool {
        match self.build(backend, kind) {
            Ok(slot) => {
                if let Some(previous) = self.slots.insert(kind, slot) {
                    if previous.program.is_valid() {
                        backend.destroy_program(previous.program);
                    }
                }
                log::info!("Reloaded shader '{}'", kind.name());
                true
            }
            Err(err) => {
                log::error!("Shader '{}' reload failed, keeping previous program: {err:#}", kind.name());
                false
            }
        }
    }

    pub fn reload_all<B: RenderBackend>(&mut self, backend: &mut B) -> Vec<ProgramKind> {
        ProgramKind::ALL.into_iter().filter(|kind| self.reload(backend, *kind)).collect()
    }

    /// Reloads every program that reads one of `paths`, by file name.
    pub fn reload_paths<B: RenderBackend>(&mut self, backend: &mut B, paths: &[PathBuf]) -> Vec<ProgramKind> {
        let changed: BTreeSet<&str> =
            paths.iter().filter_map(|path| path.file_name().and_then(|name| name.to_str())).collect();
        let affected: Vec<ProgramKind> = ProgramKind::ALL
            .into_iter()
            .filter(|kind| {
                let own = [kind.file_name().to_string()];
                let files = self.slots.get(kind).map(|slot| slot.files.as_slice()).unwrap_or(&own);
                files.iter().any(|file| changed.contains(file.as_str()))
            })
            .collect();
        affected.into_iter().filter(|kind| self.reload(backend, *kind)).collect()
    }

    /// Applies file changes seen since the last call. Call between frames only.
    pub fn check_and_reload<B: RenderBackend>(&mut self, backend: &mut B) -> Vec<ProgramKind> {
        let Some(watcher) = self.watcher.as_ref() else {
            return Vec::new();
        };
        let changes = watcher.drain_changes();
        if changes.is_empty() {
            return Vec::new();
        }
        log::debug!("Shader sources changed: {changes:?}");
        self.reload_paths(backend, &changes)
    }

    pub fn destroy_all<B: RenderBackend>(&mut self, backend: &mut B) {
        for (_, slot) in self.slots.drain() {
            if slot.program.is_valid() {
                backend.destroy_program(slot.program);
            }
        }
    }

    fn build<B: RenderBackend>(&self, backend: &mut B, kind: ProgramKind) -> Result<ProgramSlot> {
        let (source, files) = self.load_source(kind)?;
        let program = backend.compile_program(kind, &source)?;
        Ok(ProgramSlot { program, files })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::recording::RecordingBackend;

    fn resolver(files: &'static [(&'static str, &'static str)]) -> impl FnMut(&str) -> Result<String> {
        move |name: &str| {
            files
                .iter()
                .find(|(file, _)| *file == name)
                .map(|(_, text)| text.to_string())
                .ok_or_else(|| anyhow!("missing {name}"))
        }
    }

    #[test]
    fn include_lines_are_replaced_recursively() {
        let mut resolve = resolver(&[("a.wgsl", "// a\n#include \"b.wgsl\""), ("b.wgsl", "// b")]);
        let out = preprocess_source("top\n#include \"a.wgsl\"\nbottom", &mut resolve);
        assert_eq!(out, "top\n// a\n// b\nbottom\n");
    }

    #[test]
    fn broken_includes_are_dropped() {
        let mut resolve = resolver(&[("self.wgsl", "#include \"self.wgsl\"\nbody")]);
        let out = preprocess_source(
            "#include missing-quotes\n#include \"nope.wgsl\"\n#include \"self.wgsl\"\nend",
            &mut resolve,
        );
        assert_eq!(out, "body\nend\n");
    }

    #[test]
    fn embedded_sources_resolve_their_includes() {
        let library = ShaderLibrary::embedded();
        let (source, files) = library.load_source(ProgramKind::Composite).expect("embedded screen shader");
        assert!(!source.contains("#include"));
        assert!(source.contains("fn vs_fullscreen"));
        assert_eq!(files, vec!["screen.wgsl".to_string(), "fullscreen.wgsl".to_string()]);
    }

    #[test]
    fn failed_compile_yields_invalid_program() {
        let mut backend = RecordingBackend::new();
        backend.fail_program(ProgramKind::DepthDebug);
        let mut library = ShaderLibrary::embedded();
        library.compile_all(&mut backend);
        assert!(library.program(ProgramKind::Lit).is_valid());
        assert_eq!(library.program(ProgramKind::DepthDebug), ProgramId::INVALID);
    }

    #[test]
    fn failed_reload_keeps_previous_program() {
        let mut backend = RecordingBackend::new();
        let mut library = ShaderLibrary::embedded();
        library.compile_all(&mut backend);
        let before = library.program(ProgramKind::Lit);
        backend.fail_program(ProgramKind::Lit);
        assert!(!library.reload(&mut backend, ProgramKind::Lit));
        assert_eq!(library.program(ProgramKind::Lit), before);
        backend.heal_program(ProgramKind::Lit);
        assert!(library.reload(&mut backend, ProgramKind::Lit));
        assert_ne!(library.program(ProgramKind::Lit), before);
    }

    #[test]
    fn changed_include_reloads_dependents_only() {
        let mut backend = RecordingBackend::new();
        let mut library = ShaderLibrary::embedded();
        library.compile_all(&mut backend);
        let reloaded = library.reload_paths(&mut backend, &[PathBuf::from("/tmp/shaders/fullscreen.wgsl")]);
        assert_eq!(reloaded, vec![ProgramKind::Composite, ProgramKind::DepthDebug]);
    }
}
