use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use bcp_core::protocol::constants::SIGNATURE_LEN;
use bcp_core::update::ArtifactError;
use bcp_core::{Artifact, ArtifactKind, ChipVariant, EngineConfig, ImageKind, ImageSet};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Battery coprocessor engine tool", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Engine configuration files.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Validate an artifact file and report how it would be transferred.
    InspectArtifact {
        #[arg(long, value_enum)]
        kind: KindArg,
        /// Raw artifact bytes.
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// 64-byte signature for certificates and manifests.
        #[arg(long, value_name = "FILE")]
        signature: Option<PathBuf>,
        /// Image set bits for a digest dictionary (1 firmware, 2 config, 4 dnvd).
        #[arg(long, default_value_t = 0)]
        images: u8,
    },
    /// Decode a raw SendData request.
    DecodeRequest {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write the default configuration.
    Init {
        #[arg(value_name = "FILE")]
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = ChipArg::Roswell)]
        chip: ChipArg,
    },
    /// Print a configuration file after applying defaults.
    Show {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ChipArg {
    Roswell,
    Veridian,
}

impl From<ChipArg> for ChipVariant {
    fn from(chip: ChipArg) -> Self {
        match chip {
            ChipArg::Roswell => ChipVariant::Roswell,
            ChipArg::Veridian => ChipVariant::Veridian,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Certificate,
    Manifest,
    DigestDictionary,
    Firmware,
    Config,
    Dnvd,
}

impl From<KindArg> for ArtifactKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Certificate => ArtifactKind::Certificate,
            KindArg::Manifest => ArtifactKind::Manifest,
            KindArg::DigestDictionary => ArtifactKind::DigestDictionary,
            KindArg::Firmware => ArtifactKind::Image(ImageKind::Firmware),
            KindArg::Config => ArtifactKind::Image(ImageKind::Config),
            KindArg::Dnvd => ArtifactKind::Image(ImageKind::Dnvd),
        }
    }
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
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Config {
            command: ConfigCommand::Init { path, chip },
        } => {
            let mut config = EngineConfig::default();
            config.auth.chip = chip.into();
            config
                .save_to_file(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), chip = %config.auth.chip, "Configuration written");
            Ok(())
        }
        Command::Config {
            command: ConfigCommand::Show { path },
        } => {
            let config = EngineConfig::load_from_file(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::InspectArtifact {
            kind,
            file,
            signature,
            images,
        } => {
            let data = read_file(&file)?;
            let signature = signature.map(|path| read_signature(&path)).transpose()?;
            let artifact = build_artifact(kind.into(), data, signature, images)?;
            report(&artifact)
        }
        Command::DecodeRequest { file } => {
            let request = read_file(&file)?;
            let artifact = Artifact::decode(&request)?;
            report(&artifact)
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    debug!(path = %path.display(), len = data.len(), "Read file");
    Ok(data)
}

fn read_signature(path: &Path) -> Result<[u8; SIGNATURE_LEN]> {
    let raw = read_file(path)?;
    raw.as_slice().try_into().map_err(|_| {
        anyhow!(
            "signature {} is {} bytes, expected {}",
            path.display(),
            raw.len(),
            SIGNATURE_LEN
        )
    })
}

fn build_artifact(
    kind: ArtifactKind,
    data: Vec<u8>,
    signature: Option<[u8; SIGNATURE_LEN]>,
    images: u8,
) -> Result<Artifact> {
    let images =
        ImageSet::from_bits(images).ok_or_else(|| anyhow!("unknown image bits {:#04x}", images))?;

    let artifact = match kind {
        ArtifactKind::Certificate | ArtifactKind::Manifest => {
            let signature = signature.ok_or(ArtifactError::MissingSignature(kind))?;
            if kind == ArtifactKind::Certificate {
                Artifact::certificate(data, signature)
            } else {
                Artifact::manifest(data, signature)
            }
        }
        ArtifactKind::DigestDictionary => Artifact::digest_dictionary(data, images),
        ArtifactKind::Image(image) => Artifact::image(image, data),
    };

    if signature.is_some() && !kind.is_signed() {
        warn!(kind = %kind, "Signature ignored for unsigned artifact");
    }
    Ok(artifact)
}

fn report(artifact: &Artifact) -> Result<()> {
    artifact.validate()?;

    let chunks = artifact.chunks();
    println!("kind:       {}", artifact.kind);
    println!("length:     {} bytes", artifact.data.len());
    println!("chunks:     {}", chunks.total());
    if artifact.kind.is_image() {
        println!("blocks:     {}", artifact.block_count());
    }
    if artifact.kind == ArtifactKind::DigestDictionary {
        println!("images:     {:?}", artifact.images);
    }
    println!("signed:     {}", artifact.signature.is_some());
    Ok(())
}
