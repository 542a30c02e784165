use anyhow::{Context, Result};
use biogate_core::attempts::AttemptCache;
use biogate_core::{FaceProbe, Identity, ImageFrame, TemplateStore, VerificationPolicy, VoiceProbe};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod audio;
mod config;
mod engine;
mod store;

use config::Settings;
use store::SqliteStore;

#[derive(Parser)]
#[command(name = "biogate", about = "Face and voice biometric verification")]
struct Cli {
    /// TOML configuration file (defaults to $BIOGATE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct VoiceArgs {
    /// Voice sample: 16-bit PCM WAV, or raw s16le mono with --sample-rate
    #[arg(long)]
    voice: Option<PathBuf>,
    /// Sample rate of a raw PCM voice sample
    #[arg(long)]
    sample_rate: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from face frames and an optional voice sample
    Enroll {
        #[arg(short, long)]
        identity: String,
        /// Face image frames (PNG/JPEG), in capture order
        #[arg(short, long, num_args = 1.., required = true)]
        face: Vec<PathBuf>,
        #[command(flatten)]
        voice: VoiceArgs,
    },
    /// Verify an identity against its enrolled template
    Verify {
        #[arg(short, long)]
        identity: String,
        /// Face image frames (PNG/JPEG), in capture order
        #[arg(short, long, num_args = 1.., required = true)]
        face: Vec<PathBuf>,
        #[command(flatten)]
        voice: VoiceArgs,
        /// Fail unless a voice factor is evaluated
        #[arg(long)]
        require_voice: bool,
        /// Skip the blink liveness check
        #[arg(long)]
        no_liveness: bool,
        /// Failed attempts before this identity is locked out
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Replace the face and/or voice factor of an enrolled identity
    Update {
        #[arg(short, long)]
        identity: String,
        #[arg(short, long, num_args = 1..)]
        face: Vec<PathBuf>,
        #[command(flatten)]
        voice: VoiceArgs,
    },
    /// Show enrollment and lockout state (all identities when omitted)
    Status {
        #[arg(short, long)]
        identity: Option<String>,
    },
    /// Clear the failed-attempt counter of an identity
    Reset {
        #[arg(short, long)]
        identity: String,
    },
    /// Delete an identity's template
    Remove {
        #[arg(short, long)]
        identity: String,
    },
}

#[derive(Serialize)]
struct StatusReport {
    identity: Identity,
    enrolled: bool,
    version: Option<u32>,
    has_voice: bool,
    model_version: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    failed_attempts: u32,
    locked: bool,
    last_success: Option<DateTime<Utc>>,
}

fn load_face(paths: &[PathBuf]) -> Result<FaceProbe> {
    let frames = paths
        .iter()
        .map(|p| {
            let bytes = std::fs::read(p).with_context(|| format!("reading {}", p.display()))?;
            ImageFrame::decode(&bytes).with_context(|| format!("decoding {}", p.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(FaceProbe::new(frames))
}

fn load_voice(args: &VoiceArgs) -> Result<Option<VoiceProbe>> {
    args.voice
        .as_deref()
        .map(|p: &Path| audio::load_voice(p, args.sample_rate))
        .transpose()
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn status(store: &SqliteStore, settings: &Settings, identity: Identity) -> Result<StatusReport> {
    let template = store.fetch(&identity)?;
    let failed_attempts = store.count(&identity)?;
    Ok(StatusReport {
        enrolled: template.is_some(),
        version: template.as_ref().map(|t| t.version),
        has_voice: template.as_ref().is_some_and(|t| t.voice.is_some()),
        model_version: template.as_ref().and_then(|t| t.face.model_version.clone()),
        updated_at: template.as_ref().map(|t| t.updated_at),
        failed_attempts,
        locked: failed_attempts >= settings.policy.lockout(&settings.biometric.lockout).max_attempts,
        last_success: store.last_success(&identity)?,
        identity,
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    tracing::debug!(db = %settings.db_path.display(), models = %settings.model_dir.display(), "settings loaded");

    let store = Arc::new(SqliteStore::open(&settings.db_path)?);

    match cli.command {
        Commands::Enroll { identity, face, voice } => {
            let face = load_face(&face)?;
            let voice = load_voice(&voice)?;
            let engine = engine::spawn_engine(&settings, store)?;
            let decision = engine.enroll(identity.into(), face, voice).await?;
            print_json(&decision)?;
            Ok(if matches!(decision, biogate_core::EnrollmentDecision::Accepted(_)) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Verify {
            identity,
            face,
            voice,
            require_voice,
            no_liveness,
            max_attempts,
        } => {
            let face = load_face(&face)?;
            let voice = load_voice(&voice)?;
            let policy = VerificationPolicy {
                require_liveness: settings.policy.require_liveness && !no_liveness,
                require_voice: settings.policy.require_voice || require_voice,
                max_attempts: max_attempts.or(settings.policy.max_attempts),
                ..settings.policy
            };
            let engine = engine::spawn_engine(&settings, store)?;
            let decision = engine.verify(identity.into(), face, voice, policy).await?;
            print_json(&decision)?;
            Ok(if decision.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Update { identity, face, voice } => {
            let face = if face.is_empty() { None } else { Some(load_face(&face)?) };
            let voice = load_voice(&voice)?;
            let engine = engine::spawn_engine(&settings, store)?;
            let decision = engine.update(identity.into(), face, voice).await?;
            print_json(&decision)?;
            Ok(if matches!(decision, biogate_core::EnrollmentDecision::Accepted(_)) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Status { identity } => {
            let identities = match identity {
                Some(id) => vec![Identity::from(id)],
                None => store.identities()?,
            };
            let reports = identities
                .into_iter()
                .map(|id| status(&store, &settings, id))
                .collect::<Result<Vec<_>>>()?;
            print_json(&reports)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reset { identity } => {
            let identity = Identity::from(identity);
            store.reset(&identity)?;
            tracing::info!(identity = %identity, "attempt counter cleared");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Remove { identity } => {
            let identity = Identity::from(identity);
            if store.remove(&identity)? {
                tracing::info!(identity = %identity, "template removed");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("{identity} is not enrolled");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
