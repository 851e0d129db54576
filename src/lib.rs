pub mod app;
pub mod camera;
pub mod cli;
pub mod config;
pub mod events;
pub mod mesh;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod texture;
pub mod time;

pub use app::{run, run_with_overrides, App};
