use clap::Parser;
use std::path::PathBuf;

/// `compute_viewer` - Runs a JSON compute scene in a window.
///
/// The scene declares data buffers, the compute units that process them and
/// the views presenting the results. Units dispatch in step with the window's
/// frame loop.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The JSON scene description to load.
    ///
    /// Shader and payload paths inside the scene resolve relative to this
    /// file's directory.
    #[arg(env = "COMPUTE_VIEWER_SCENE")]
    pub scene: PathBuf,

    /// Initial window width in logical pixels.
    #[arg(long, env = "COMPUTE_VIEWER_WIDTH", default_value_t = 1280)]
    pub width: u32,

    /// Initial window height in logical pixels.
    #[arg(long, env = "COMPUTE_VIEWER_HEIGHT", default_value_t = 720)]
    pub height: u32,

    /// Window title.
    #[arg(long, default_value = "Compute Viewer")]
    pub title: String,

    /// Prefer an integrated GPU over a discrete one.
    #[arg(long)]
    pub low_power: bool,
}
