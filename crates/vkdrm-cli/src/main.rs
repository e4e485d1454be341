mod info;
mod present;
mod scanout;
mod verify;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vkdrm_core::config::{default_config_path, VkdrmConfig};

#[derive(Parser)]
#[command(name = "vkdrm")]
#[command(about = "vkdrm - clear a Vulkan image and put it on screen through KMS")]
#[command(version)]
struct Cli {
    /// Configuration file path (default: /etc/vkdrm/vkdrm.toml, then ./vkdrm.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the Vulkan loader version, physical devices and displays
    Info,

    /// Clear an offscreen image and scan it out on a KMS plane
    Scanout {
        /// DRM card node
        #[arg(long)]
        card: Option<String>,

        /// Plane object id to commit to
        #[arg(long)]
        plane: Option<u32>,

        /// Framebuffer pitch in bytes (default: the image's row pitch)
        #[arg(long)]
        stride: Option<u32>,

        /// Image width
        #[arg(long)]
        width: Option<u32>,

        /// Image height
        #[arg(long)]
        height: Option<u32>,

        /// How long the frame stays on screen, in milliseconds
        #[arg(long)]
        hold_ms: Option<u64>,

        /// Use a blocking commit for the scanout as well as the restore
        #[arg(long)]
        blocking: bool,

        /// Skip the CPU readback of the cleared image
        #[arg(long)]
        no_verify: bool,

        /// Enable the Khronos validation layer
        #[arg(long)]
        validation: bool,
    },

    /// Clear a swapchain image on a VK_KHR_display surface and present it
    Present {
        /// Display index as listed by `vkdrm info`
        #[arg(long)]
        display: Option<usize>,

        /// How long the frame stays on screen, in milliseconds
        #[arg(long)]
        hold_ms: Option<u64>,

        /// Enable the Khronos validation layer
        #[arg(long)]
        validation: bool,
    },

    /// Check that this machine can run the scanout and present paths
    Verify {
        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    vkdrm_common::init_logging();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Info => {
            let config = load_config(&config_path, cli.config.is_some())?;
            info::run(&config)?;
        }

        Commands::Scanout {
            card,
            plane,
            stride,
            width,
            height,
            hold_ms,
            blocking,
            no_verify,
            validation,
        } => {
            let mut config = load_config(&config_path, cli.config.is_some())?;

            // CLI flags override the file
            if let Some(card) = card {
                config.kms.card = card;
            }
            if let Some(plane) = plane {
                config.kms.plane = plane;
            }
            if stride.is_some() {
                config.kms.stride = stride;
            }
            if let Some(width) = width {
                config.image.width = width;
            }
            if let Some(height) = height {
                config.image.height = height;
            }
            if let Some(hold_ms) = hold_ms {
                config.kms.hold_ms = hold_ms;
            }
            if blocking {
                config.kms.nonblocking = false;
            }
            if no_verify {
                config.image.verify_readback = false;
            }
            if validation {
                config.vulkan.validation = true;
            }
            config
                .validate()
                .context("invalid configuration after applying flags")?;

            info!(
                "scanout {}x{} on {} plane {}",
                config.image.width, config.image.height, config.kms.card, config.kms.plane
            );
            scanout::run(&config)?;
        }

        Commands::Present {
            display,
            hold_ms,
            validation,
        } => {
            let mut config = load_config(&config_path, cli.config.is_some())?;
            if let Some(display) = display {
                config.present.display_index = display;
            }
            if let Some(hold_ms) = hold_ms {
                config.present.hold_ms = hold_ms;
            }
            if validation {
                config.vulkan.validation = true;
            }

            info!("presenting on display {}", config.present.display_index);
            present::run(&config)?;
        }

        Commands::Verify { json } => {
            verify::run_verify(&config_path, json)?;
        }
    }

    Ok(())
}

/// An explicitly named file must load; the default search falls back to
/// built-in values when nothing is installed.
fn load_config(path: &str, explicit: bool) -> anyhow::Result<VkdrmConfig> {
    if explicit {
        return VkdrmConfig::load(path).with_context(|| format!("loading {}", path));
    }
    if !std::path::Path::new(path).exists() {
        warn!("no config at {}, using defaults", path);
    }
    Ok(VkdrmConfig::load_or_default(path))
}
