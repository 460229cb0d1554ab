use anyhow::Result;
use clap::{Parser, Subcommand};
use fwkit_core::context::{Context, EspFileFlags, HwidLoadFlags};
use fwkit_core::progress::Progress;
use tracing::error;

#[derive(Parser, Debug)]
#[command(author, version, about = "Firmware platform inspection tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the hardware identity values and GUIDs
    Hwids,
    /// List ESP candidates and the volume that would be used
    Esp,
    /// Look up quirk values for a GUID
    Quirks {
        /// Hardware GUID to query
        guid: String,
        /// Specific key, or all keys when omitted
        key: Option<String>,
    },
    /// List the PE boot assets referenced by the boot order
    BootAssets,
}

fn load_context() -> Result<Context> {
    let mut ctx = Context::new();
    ctx.load_quirks()?;
    let mut progress = Progress::with_callback(|fraction, name| {
        tracing::debug!(step = name, "{:3.0}%", fraction * 100.0);
    });
    ctx.load_hwinfo(
        &mut progress,
        HwidLoadFlags::CONFIG
            | HwidLoadFlags::SMBIOS
            | HwidLoadFlags::FDT
            | HwidLoadFlags::KENV
            | HwidLoadFlags::DMI
            | HwidLoadFlags::DARWIN,
    )?;
    Ok(ctx)
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Hwids => {
            let ctx = load_context()?;
            println!("values:");
            for key in [
                fwkit_core::hwids::KEY_MANUFACTURER,
                fwkit_core::hwids::KEY_FAMILY,
                fwkit_core::hwids::KEY_PRODUCT_NAME,
                fwkit_core::hwids::KEY_PRODUCT_SKU,
                fwkit_core::hwids::KEY_BIOS_VENDOR,
                fwkit_core::hwids::KEY_BIOS_VERSION,
            ] {
                if let Some(value) = ctx.hwid_value(key) {
                    println!("  {key}: {value}");
                }
            }
            println!("guids:");
            for guid in ctx.hwid_guids() {
                println!("  {guid}");
            }
        }
        Command::Esp => {
            let mut ctx = load_context()?;
            for volume in ctx.esp_volumes()? {
                println!(
                    "{} kind={} size={}MiB",
                    volume.id(),
                    volume.partition_kind(),
                    volume.size() / (1024 * 1024)
                );
            }
            let best = ctx.default_esp()?;
            println!("selected: {}", best.id());
        }
        Command::Quirks { guid, key } => {
            let mut ctx = Context::new();
            ctx.load_quirks()?;
            let matched = ctx.lookup_quirk_by_id_iter(&guid, key.as_deref(), |key, value, source| {
                println!("{key} = {value} ({source})");
            });
            if !matched {
                println!("no quirks for {guid}");
            }
        }
        Command::BootAssets => {
            let mut ctx = load_context()?;
            let files = ctx.esp_files(
                EspFileFlags::FIRST_STAGE | EspFileFlags::SECOND_STAGE | EspFileFlags::REVOCATIONS,
            )?;
            for pe in files {
                println!(
                    "{} machine={:#06x} size={}",
                    pe.filename.as_deref().unwrap_or("?"),
                    pe.machine,
                    pe.size
                );
            }
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args.command) {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
