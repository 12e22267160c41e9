//! Neondrive library - audio-reactive procedural city visualization

pub mod animate;
pub mod audio;
pub mod bridge;
pub mod cli;
pub mod params;
pub mod rendering;
pub mod scene;
