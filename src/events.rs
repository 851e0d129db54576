use std::fmt;

/// Requests produced by the windowing layer and applied at frame boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderCommand {
    Resize { width: u32, height: u32 },
    ShowDepthLayer(Option<u32>),
    ReloadShaders,
}

impl fmt::Display for RenderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderCommand::Resize { width, height } => write!(f, "Resize {width}x{height}"),
            RenderCommand::ShowDepthLayer(Some(layer)) => write!(f, "ShowDepthLayer layer={layer}"),
            RenderCommand::ShowDepthLayer(None) => write!(f, "ShowDepthLayer off"),
            RenderCommand::ReloadShaders => write!(f, "ReloadShaders"),
        }
    }
}

#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: Vec<RenderCommand>,
}

impl CommandQueue {
    pub fn push(&mut self, command: RenderCommand) {
        self.commands.push(command);
    }

    pub fn drain(&mut self) -> Vec<RenderCommand> {
        self.commands.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_order_and_empties_queue() {
        let mut queue = CommandQueue::default();
        queue.push(RenderCommand::Resize { width: 800, height: 600 });
        queue.push(RenderCommand::ShowDepthLayer(Some(2)));
        queue.push(RenderCommand::Resize { width: 1024, height: 768 });
        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[2], RenderCommand::Resize { width: 1024, height: 768 });
        assert!(queue.is_empty());
        assert_eq!(drained[1].to_string(), "ShowDepthLayer layer=2");
    }
}
