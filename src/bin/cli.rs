//! Updraft CLI - Main entry point for the client binary
//!
//! Downloads and verifies updates, manages signer trust and carries the
//! publisher tooling. `updraft scrape` runs one server refresh.

use clap::Parser;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use updraft_lib::engine::{
    api::RegisterTokenRequest,
    cli::formatter::{format_size, short_fingerprint, CliFormatter},
    cli::{Cli, Commands, OutputFormat, PublishAction, TrustAction},
    config::ClientConfig,
    locks::{LockType, OperationLock},
    updater::{
        backoff::BackoffPolicy,
        capabilities::{
            DownloadTransport, InstalledVersionProbe, KeyValueStore, TransportRecord,
        },
        client::LatestClient,
        device::device_id,
        download::HttpDownloadTransport,
        kv::JsonFileStore,
        notify::ConsoleNotifier,
        orchestrator::SignerVerdict,
        probe::CommandVersionProbe,
        verify::{self, ZipSignerInspector},
        LocalRecords, Orchestrator, RetryScheduler, ScheduleOutcome, TrustStore, UpdateSession,
        Verdict,
    },
    Database, Refresher, ServerConfig,
};

type CliResult = Result<(), Box<dyn Error>>;

const STATE_FILE: &str = "state.json";
const TRANSFER_POLL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "updraft_lib=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run_cli(cli).await {
        CliFormatter::error(&e.to_string());
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> CliResult {
    let data_dir = cli.get_data_dir();
    let json_output = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Init {
            backend_url,
            api_key,
            download_dir,
            installed_binary,
        } => cmd_init(&data_dir, &backend_url, api_key, download_dir, installed_binary, json_output),
        Commands::Check => cmd_check(&data_dir, json_output).await,
        Commands::Download { no_verify } => cmd_download(&data_dir, no_verify, json_output).await,
        Commands::Verify => cmd_verify(&data_dir, json_output).await,
        Commands::Status => cmd_status(&data_dir, json_output),
        Commands::Discard => cmd_discard(&data_dir, json_output),
        Commands::Trust { action } => cmd_trust(&data_dir, action, json_output),
        Commands::Register { token, platform } => {
            cmd_register(&data_dir, token, platform, json_output).await
        }
        Commands::Publish { action } => cmd_publish(action, json_output),
        Commands::Scrape => cmd_scrape(json_output).await,
    }
}

/// Components shared by the client commands
struct ClientContext {
    config: ClientConfig,
    data_dir: PathBuf,
    records: LocalRecords,
    transport: Arc<HttpDownloadTransport>,
    notifier: Arc<ConsoleNotifier>,
}

impl ClientContext {
    fn open(data_dir: &Path) -> Result<Self, Box<dyn Error>> {
        let config = ClientConfig::load(data_dir)?;
        let kv: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(&data_dir.join(STATE_FILE)));
        let transport = Arc::new(HttpDownloadTransport::default().with_journal(Arc::clone(&kv)));
        Ok(Self {
            notifier: Arc::new(ConsoleNotifier::new(config.notifications)),
            records: LocalRecords::new(kv),
            data_dir: data_dir.to_path_buf(),
            transport,
            config,
        })
    }

    fn session(&self) -> UpdateSession {
        UpdateSession::new(
            self.transport.clone(),
            self.notifier.clone(),
            self.records.clone(),
            &self.config.download_dir,
        )
    }

    fn latest_client(&self) -> Result<LatestClient, Box<dyn Error>> {
        Ok(LatestClient::from_config(&self.config)?)
    }

    fn probe(&self) -> CommandVersionProbe {
        CommandVersionProbe::new(self.config.installed_binary.clone())
    }

    fn scheduler(&self) -> Result<RetryScheduler, Box<dyn Error>> {
        let orchestrator = Orchestrator::new(
            self.transport.clone(),
            Arc::new(self.latest_client()?),
            Arc::new(ZipSignerInspector),
            self.notifier.clone(),
            self.records.clone(),
            BackoffPolicy::from(&self.config.backoff),
        );
        Ok(RetryScheduler::new(Arc::new(orchestrator))
            .with_max_attempts(self.config.backoff.max_attempts))
    }

    fn locks(&self) -> OperationLock {
        OperationLock::new(&self.data_dir.join("locks"))
    }
}

fn cmd_init(
    data_dir: &Path,
    backend_url: &str,
    api_key: String,
    download_dir: Option<PathBuf>,
    installed_binary: Option<PathBuf>,
    json: bool,
) -> CliResult {
    // Reject unusable URLs before writing anything
    LatestClient::new(backend_url, &api_key)?;

    let mut config = ClientConfig::default_for_backend(backend_url, data_dir);
    config.api_key = api_key;
    if let Some(dir) = download_dir {
        config.download_dir = dir;
    }
    config.installed_binary = installed_binary;
    config.save(data_dir)?;

    let records = LocalRecords::new(Arc::new(JsonFileStore::new(&data_dir.join(STATE_FILE))));
    let device = device_id(&records)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "success": true,
                "data_dir": data_dir,
                "backend": config.backend_base_url,
                "download_dir": config.download_dir,
                "device_id": device,
            })
        );
    } else {
        CliFormatter::success("Client configured");
        CliFormatter::kv("Data dir", &data_dir.display().to_string());
        CliFormatter::kv("Backend", &config.backend_base_url);
        CliFormatter::kv("Downloads", &config.download_dir.display().to_string());
        CliFormatter::kv("Device", &device);
    }
    Ok(())
}

async fn cmd_check(data_dir: &Path, json: bool) -> CliResult {
    let ctx = ClientContext::open(data_dir)?;
    let latest = ctx.latest_client()?.latest().await?;
    let installed = ctx.probe().probe().await;
    let up_to_date = match (&latest, &installed.version_name) {
        (Some(latest), Some(version)) => latest.version_label == *version,
        _ => false,
    };

    if json {
        println!(
            "{}",
            serde_json::json!({
                "latest": latest,
                "installed": installed,
                "up_to_date": up_to_date,
            })
        );
        return Ok(());
    }

    CliFormatter::header("Update check");
    CliFormatter::kv("Installed", &installed.display());
    match latest {
        Some(latest) => {
            CliFormatter::kv("Latest", &latest.version_label);
            CliFormatter::kv("Published", &latest.published_at.to_rfc3339());
            CliFormatter::kv("Size", &format_size(latest.size_bytes));
            CliFormatter::kv(
                "SHA-256",
                latest.content_hash.as_deref().unwrap_or("(not yet computed)"),
            );
            if up_to_date {
                CliFormatter::success("Up to date");
            } else {
                CliFormatter::info("Run `updraft download` to fetch it");
            }
        }
        None => CliFormatter::warning("The backend has not published an artifact yet"),
    }
    Ok(())
}

async fn cmd_download(data_dir: &Path, no_verify: bool, json: bool) -> CliResult {
    let ctx = ClientContext::open(data_dir)?;
    let Some(latest) = ctx.latest_client()?.latest().await? else {
        return Err("the backend has not published an artifact yet".into());
    };

    let locks = ctx.locks();
    let _guard = locks.acquire(LockType::Verify)?;

    let started = ctx.session().begin_download(&latest)?;
    if !json {
        CliFormatter::info(&format!(
            "Downloading {} to {}",
            latest.version_label,
            started.target_path.display()
        ));
    }

    let record = wait_for_transfer(ctx.transport.as_ref(), &started.session_id, json).await;
    if no_verify {
        if json {
            println!(
                "{}",
                serde_json::json!({ "session": started, "transport": record })
            );
        } else if let Some(record) = &record {
            report_transfer(record);
        }
        return Ok(());
    }

    let outcome = ctx.scheduler()?.run(&started.session_id).await;
    report_schedule(&outcome, json)
}

async fn cmd_verify(data_dir: &Path, json: bool) -> CliResult {
    let ctx = ClientContext::open(data_dir)?;
    let Some(session) = ctx.records.session()? else {
        return Err("no download session; run `updraft download` first".into());
    };
    if ctx.transport.query(&session.session_id).is_none() {
        return Err(format!(
            "download {} did not finish in a previous run; run `updraft download` again",
            session.session_id
        )
        .into());
    }

    let locks = ctx.locks();
    let _guard = locks.acquire(LockType::Verify)?;
    let outcome = ctx.scheduler()?.run(&session.session_id).await;
    report_schedule(&outcome, json)
}

fn cmd_status(data_dir: &Path, json: bool) -> CliResult {
    let ctx = ClientContext::open(data_dir)?;
    let status = ctx.session().status()?;
    let verifying = ctx.locks().holder(LockType::Verify);

    if json {
        println!(
            "{}",
            serde_json::json!({
                "status": status,
                "verify_lock": verifying,
            })
        );
        return Ok(());
    }

    CliFormatter::header("Update status");
    match &status.session {
        Some(session) => {
            CliFormatter::kv("Session", &session.session_id);
            CliFormatter::kv("Version", &session.version_label);
            CliFormatter::kv("Target", &session.target_path.display().to_string());
        }
        None => CliFormatter::kv("Session", "(none)"),
    }
    if let Some(transport) = &status.transport {
        let progress = transport
            .progress_percent()
            .map(|p| format!(" ({p:.0}%)"))
            .unwrap_or_default();
        CliFormatter::kv(
            "Transfer",
            &format!("{:?}{} {}", transport.status, progress, format_size(transport.bytes_downloaded)),
        );
    }
    if let Some(verification) = &status.verification {
        let outcome = verification.outcome.as_deref().unwrap_or("-");
        CliFormatter::kv(
            "Verification",
            &format!("{:?} (attempt {}, outcome {})", verification.phase, verification.attempt, outcome),
        );
    }
    if let Some(info) = verifying {
        CliFormatter::kv("Verifier", &format!("running as PID {}", info.pid));
    }
    match &status.ready_to_install {
        Some(pending) => CliFormatter::success(&format!(
            "Ready to install: {}",
            pending.artifact_path.display()
        )),
        None if status.stale_pending_install => {
            CliFormatter::warning("An approval from a discarded session was ignored")
        }
        None => CliFormatter::info("Nothing ready to install"),
    }
    print_trust(&status.trust);
    Ok(())
}

fn cmd_discard(data_dir: &Path, json: bool) -> CliResult {
    let ctx = ClientContext::open(data_dir)?;
    ctx.session().discard()?;
    if json {
        println!("{}", serde_json::json!({ "success": true }));
    } else {
        CliFormatter::success("Download session discarded");
    }
    Ok(())
}

fn cmd_trust(data_dir: &Path, action: TrustAction, json: bool) -> CliResult {
    let ctx = ClientContext::open(data_dir)?;
    let trust = TrustStore::new(ctx.records.clone());

    match action {
        TrustAction::Show => {
            let record = trust.get()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                CliFormatter::header("Signer trust");
                print_trust(&record);
            }
        }
        TrustAction::Accept => {
            let accepted = trust.accept_pending()?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "success": accepted.is_some(), "trusted": accepted })
                );
            } else {
                match accepted {
                    Some(fp) => CliFormatter::success(&format!("Now trusting {}", short_fingerprint(&fp))),
                    None => CliFormatter::warning("No observed signer to accept"),
                }
            }
        }
        TrustAction::Reset => {
            trust.reset()?;
            if json {
                println!("{}", serde_json::json!({ "success": true }));
            } else {
                CliFormatter::success("Signer trust cleared; the next artifact is trusted on first use");
            }
        }
    }
    Ok(())
}

async fn cmd_register(
    data_dir: &Path,
    token: String,
    platform: Option<String>,
    json: bool,
) -> CliResult {
    let ctx = ClientContext::open(data_dir)?;
    let installed = ctx.probe().probe().await;
    let request = RegisterTokenRequest {
        token,
        app_version: installed.version_name,
        device_id: Some(device_id(&ctx.records)?),
        platform,
    };
    ctx.latest_client()?.register_token(&request).await?;

    if json {
        println!("{}", serde_json::json!({ "success": true, "device_id": request.device_id }));
    } else {
        CliFormatter::success("Push token registered");
    }
    Ok(())
}

fn cmd_publish(action: PublishAction, json: bool) -> CliResult {
    match action {
        PublishAction::Keygen { out } => {
            if out.exists() {
                return Err(format!("{} already exists", out.display()).into());
            }
            let key = verify::generate_signing_key();
            verify::save_signing_key(&out, &key)?;
            let fp = verify::fingerprint(&key.verifying_key());
            if json {
                println!("{}", serde_json::json!({ "key": out, "fingerprint": fp }));
            } else {
                CliFormatter::success(&format!("Signing key written to {}", out.display()));
                CliFormatter::kv("Fingerprint", &fp);
                CliFormatter::warning("Keep this key private; clients pin its fingerprint");
            }
        }
        PublishAction::Sign { input, key, output } => {
            let key = verify::load_signing_key(&key)?;
            let output = output.unwrap_or_else(|| input.clone());
            let fp = verify::sign_artifact(&input, &output, &key)?;
            if json {
                println!("{}", serde_json::json!({ "artifact": output, "fingerprint": fp }));
            } else {
                CliFormatter::success(&format!("Signed {}", output.display()));
                CliFormatter::kv("Fingerprint", &fp);
            }
        }
        PublishAction::Fingerprint { key } => {
            let key = verify::load_signing_key(&key)?;
            let fp = verify::fingerprint(&key.verifying_key());
            if json {
                println!("{}", serde_json::json!({ "fingerprint": fp }));
            } else {
                println!("{fp}");
            }
        }
    }
    Ok(())
}

async fn cmd_scrape(json: bool) -> CliResult {
    let config = ServerConfig::from_env()?;
    let db = Database::new(&config.database_path)?;
    let outcome = Refresher::new(db, &config).refresh().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    if outcome.is_new {
        CliFormatter::success(&format!("New artifact {}", outcome.latest.version_label));
    } else {
        CliFormatter::info(&format!("Unchanged: {}", outcome.latest.version_label));
    }
    CliFormatter::kv("URL", &outcome.latest.artifact_url);
    CliFormatter::kv(
        "SHA-256",
        outcome.latest.content_hash.as_deref().unwrap_or("-"),
    );
    if let Some(pushed) = outcome.pushed {
        CliFormatter::kv(
            "Push",
            &format!(
                "{} sent, {} failed, {} pruned",
                pushed.succeeded, pushed.failed, pushed.pruned
            ),
        );
    }
    Ok(())
}

/// Poll the transport until the transfer reaches a terminal status
async fn wait_for_transfer(
    transport: &dyn DownloadTransport,
    handle: &str,
    json: bool,
) -> Option<TransportRecord> {
    loop {
        let record = transport.query(handle)?;
        if record.status.is_terminal() {
            if !json {
                CliFormatter::transfer(record.bytes_downloaded, record.total_bytes);
                CliFormatter::end_line();
            }
            return Some(record);
        }
        if !json {
            CliFormatter::transfer(record.bytes_downloaded, record.total_bytes);
        }
        tokio::time::sleep(TRANSFER_POLL).await;
    }
}

fn report_transfer(record: &TransportRecord) {
    match &record.failure_reason {
        Some(reason) => CliFormatter::warning(&format!("Transfer failed: {reason}")),
        None => CliFormatter::success(&format!(
            "Transfer finished ({}); run `updraft verify`",
            format_size(record.bytes_downloaded)
        )),
    }
}

fn report_schedule(outcome: &ScheduleOutcome, json: bool) -> CliResult {
    if json {
        let value = match outcome {
            ScheduleOutcome::Finished(verdict) => serde_json::to_value(verdict)?,
            ScheduleOutcome::Exhausted { attempts } => serde_json::json!({
                "verdict": "exhausted",
                "attempts": attempts,
            }),
            ScheduleOutcome::AlreadyActive => serde_json::json!({ "verdict": "already_active" }),
        };
        println!("{value}");
    } else {
        match outcome {
            ScheduleOutcome::Finished(Verdict::Approved {
                artifact_path,
                signer,
            }) => {
                match signer {
                    SignerVerdict::Trusted {
                        fingerprint,
                        first_use,
                    } => {
                        if *first_use {
                            CliFormatter::info(&format!(
                                "Pinned signer {} on first use",
                                short_fingerprint(fingerprint)
                            ));
                        }
                    }
                    SignerVerdict::Changed { trusted, observed } => {
                        CliFormatter::warning(&format!(
                            "Signer changed from {} to {}; review it and run `updraft trust accept`",
                            short_fingerprint(trusted),
                            short_fingerprint(observed)
                        ));
                    }
                }
                CliFormatter::success(&format!("Verified: {}", artifact_path.display()));
            }
            // Reported once by main through the returned error
            ScheduleOutcome::Finished(Verdict::Failed { .. }) => {}
            ScheduleOutcome::Exhausted { attempts } => {
                CliFormatter::warning(&format!(
                    "Download still unfinished after {attempts} attempts; run `updraft verify` later"
                ));
            }
            ScheduleOutcome::AlreadyActive => {
                CliFormatter::info("Verification already running");
            }
        }
    }

    match outcome {
        ScheduleOutcome::Finished(Verdict::Failed { reason }) => {
            Err(format!("Verification failed [{}]: {}", reason.code(), reason).into())
        }
        _ => Ok(()),
    }
}

fn print_trust(record: &updraft_lib::engine::updater::trust::TrustRecord) {
    let show = |fp: &Option<String>| {
        fp.as_deref()
            .map(short_fingerprint)
            .unwrap_or_else(|| "(none)".to_string())
    };
    CliFormatter::kv("Trusted signer", &show(&record.trusted_signer_fingerprint));
    CliFormatter::kv("Last observed", &show(&record.pending_signer_fingerprint));
    if record.signer_changed {
        CliFormatter::warning("The last artifact was signed by a different key");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use updraft_lib::engine::updater::orchestrator::FailureReason;

    #[test]
    fn test_failed_verdict_becomes_single_error() {
        let outcome = ScheduleOutcome::Finished(Verdict::Failed {
            reason: FailureReason::TransportFailed("connection reset".to_string()),
        });
        let err = report_schedule(&outcome, false).unwrap_err().to_string();
        assert!(err.contains("transport_failed"));
        assert!(err.contains("connection reset"));
    }

    #[test]
    fn test_non_failures_are_ok() {
        assert!(report_schedule(&ScheduleOutcome::AlreadyActive, true).is_ok());
        assert!(report_schedule(&ScheduleOutcome::Exhausted { attempts: 3 }, false).is_ok());
    }
}
