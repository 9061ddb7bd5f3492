use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use arm_image_builder::builder::Builder;
use arm_image_builder::config::{self, FlashConfig};
use arm_image_builder::error::ErrorKind;
use arm_image_builder::executor::ExecCtx;
use arm_image_builder::flasher::Flasher;
use arm_image_builder::pipeline::StepInfo;
use arm_image_builder::ui::{BasicUi, Ui};
use arm_image_builder::Result;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build an image from a build definition
    Build {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Flash the image once the build succeeds
        #[arg(long)]
        flash: bool,
    },
    /// Validate a build definition and print the steps it would run
    Plan {
        /// Path to a build definition TOML
        build: PathBuf,
    },
    /// Print the fully-resolved TOML (after imports/extends)
    Resolve {
        /// Path to a build definition TOML
        build: PathBuf,
    },
    /// Write an image to removable media
    Flash {
        /// Image to write (default: newest image in . or ./output-*/)
        #[arg(long)]
        image: Option<PathBuf>,
        /// Target device, e.g. /dev/sdb
        #[arg(long)]
        device: Option<String>,
        /// Never prompt; fail instead of guessing
        #[arg(long)]
        non_interactive: bool,
        /// Skip reading the device back after writing
        #[arg(long)]
        no_verify: bool,
        /// Take defaults from the [flash] table of a build definition
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("ARMIMG_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let json = std::env::var("ARMIMG_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        fmt.json().try_init()
    } else {
        fmt.try_init()
    };
}

fn install_interrupt_handler(ctx: &ExecCtx) {
    let ctx = ctx.clone();
    let res = ctrlc::set_handler(move || {
        if ctx.cancelled() {
            return;
        }
        ctx.ui.error("interrupt received, cleaning up");
        ctx.request_cancel();
        ctx.kill_running_children();
    });
    if let Err(e) = res {
        tracing::warn!("failed to install interrupt handler: {e}");
    }
}

fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();
    let ui: Arc<dyn Ui> = Arc::new(BasicUi::new());

    let res = match args.cmd {
        Command::Build { build, flash } => cmd_build(&build, flash, ui),
        Command::Plan { build } => cmd_plan(&build),
        Command::Resolve { build } => cmd_resolve(&build),
        Command::Flash {
            image,
            device,
            non_interactive,
            no_verify,
            config,
        } => {
            let opts = FlashOpts {
                image,
                device,
                non_interactive,
                no_verify,
            };
            cmd_flash(config.as_deref(), opts, ui)
        }
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.kind() {
            ErrorKind::Declined => {
                println!("{e}");
                ExitCode::from(1)
            }
            ErrorKind::Cancelled => {
                eprintln!("error: {e}");
                ExitCode::from(130)
            }
            _ => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

fn cmd_build(path: &Path, flash: bool, ui: Arc<dyn Ui>) -> Result<()> {
    let doc = config::load(path)?;
    let (cfg, warnings) = config::build_config(&doc)?;
    for w in &warnings {
        ui.error(&format!("warning: {w}"));
    }
    let mut flash_cfg = config::flash_config(&doc)?;

    let ctx = ExecCtx::new(ui.clone());
    install_interrupt_handler(&ctx);

    let artifact = Builder::new(cfg).run(&ctx)?;
    ui.say(&format!("Image ready: {}", artifact.image.display()));

    if flash || flash_cfg.enabled {
        flash_cfg.image.get_or_insert_with(|| artifact.image.clone());
        let report = Flasher::new(flash_cfg, ui.clone())
            .with_cancel(ctx.cancel.clone())
            .flash()?;
        ui.say(&format!("Flashed {}", report.device));
    }
    Ok(())
}

fn cmd_plan(path: &Path) -> Result<()> {
    let doc = config::load(path)?;
    let (cfg, warnings) = config::build_config(&doc)?;
    for w in &warnings {
        eprintln!("warning: {w}");
    }
    let mut builder = Builder::new(cfg);
    for (i, step) in builder.steps().iter().enumerate() {
        println!(
            "{:>2}. {:<24} {}{}",
            i + 1,
            step.id(),
            step.label(),
            if step.privileged() { "  [root]" } else { "" }
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = config::load(path)?;
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}

struct FlashOpts {
    image: Option<PathBuf>,
    device: Option<String>,
    non_interactive: bool,
    no_verify: bool,
}

fn cmd_flash(config_path: Option<&Path>, opts: FlashOpts, ui: Arc<dyn Ui>) -> Result<()> {
    let mut cfg = match config_path {
        Some(p) => config::flash_config(&config::load(p)?)?,
        None => FlashConfig::default(),
    };
    if opts.image.is_some() {
        cfg.image = opts.image;
    }
    if opts.device.is_some() {
        cfg.device = opts.device;
    }
    if opts.non_interactive {
        cfg.interactive = false;
    }
    if opts.no_verify {
        cfg.verify = false;
    }

    let ctx = ExecCtx::new(ui.clone());
    install_interrupt_handler(&ctx);
    let report = Flasher::new(cfg, ui.clone())
        .with_cancel(ctx.cancel.clone())
        .flash()?;
    ui.say(&format!(
        "Flashed {} to {} ({} bytes, sha256 {})",
        report.image.display(),
        report.device,
        report.bytes_written,
        report.sha256
    ));
    Ok(())
}
