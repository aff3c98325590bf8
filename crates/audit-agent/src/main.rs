use std::collections::BTreeSet;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

use forensics::error::AuditError;
use forensics::events::ProgressEvent;
use forensics::osint::consensus::ReputationTracker;
use forensics::osint::feeds::ThreatFeeds;
use forensics::osint::source::{SourceCategory, SourceRegistry, TrustLevel};
use forensics::osint::sources::{
    builtin_spec, DarknetFeedSource, DnsSource, DomainBlocklistSource, HttpReputationSource,
    PhishingFeedSource,
};
use forensics::osint::{FanoutConfig, FanoutEngine, IntelCache};
use forensics::state::{AuditStatus, AuditTier, VerdictMode};
use forensics::transport::{
    compare_streams, select_mode_from_env, EventQueue, ModeOverride, ProgressEmitter,
    StdoutSink, SupervisorReader, TransportMode,
};
use tokio_util::sync::CancellationToken;

use audit_agent::config::AuditConfig;
use audit_agent::orchestrator::{AuditOptions, AuditRun, Collaborators, Orchestrator};
use audit_agent::phases::judge::DefaultJudgePolicy;
use audit_agent::phases::scout::HttpScout;
use audit_agent::phases::security::{
    FormCaptureModule, PhishingBlocklistModule, TransportSecurityModule,
};
use audit_agent::phases::vision::{NoopVision, RemoteVision};
use audit_agent::phases::{SecurityModule, VisionModel};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TierArg {
    Quick,
    Standard,
    Deep,
}

impl From<TierArg> for AuditTier {
    fn from(tier: TierArg) -> Self {
        match tier {
            TierArg::Quick => AuditTier::Quick,
            TierArg::Standard => AuditTier::Standard,
            TierArg::Deep => AuditTier::Deep,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VerdictModeArg {
    Simple,
    Expert,
}

impl From<VerdictModeArg> for VerdictMode {
    fn from(mode: VerdictModeArg) -> Self {
        match mode {
            VerdictModeArg::Simple => VerdictMode::Simple,
            VerdictModeArg::Expert => VerdictMode::Expert,
        }
    }
}

/// Autonomous forensic audit of a web URL.
#[derive(Debug, Parser)]
#[command(name = "audit", version)]
struct Cli {
    /// Target URL to audit.
    url: String,

    /// Audit depth tier.
    #[arg(long, value_enum, default_value_t = TierArg::Standard)]
    tier: TierArg,

    /// Verdict rendering mode.
    #[arg(long = "verdict-mode", value_enum, default_value_t = VerdictModeArg::Simple)]
    verdict_mode: VerdictModeArg,

    /// Force the structured queue transport.
    #[arg(long = "use-queue-ipc", conflicts_with_all = ["use_stdout", "validate_ipc"])]
    use_queue_ipc: bool,

    /// Force the sentinel stdout transport.
    #[arg(long = "use-stdout", conflicts_with = "validate_ipc")]
    use_stdout: bool,

    /// Run the audit once per transport mode and compare the streams.
    #[arg(long = "validate-ipc")]
    validate_ipc: bool,

    /// Pretty-print the final result JSON.
    #[arg(long)]
    json: bool,

    /// Increase log verbosity (-v debug, -vv trace). Logs go to stderr.
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Comma-separated security module allowlist.
    #[arg(long = "security-modules")]
    security_modules: Option<String>,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_collaborators(config: &AuditConfig) -> Collaborators {
    let feeds = Arc::new(match &config.feeds_dir {
        Some(dir) => ThreatFeeds::load(dir),
        None => {
            warn!("THREAT_FEEDS_DIR not set, feed-backed checks will miss everything");
            ThreatFeeds::empty()
        }
    });

    let mut registry = SourceRegistry::new();
    registry.register(Arc::new(DnsSource::new()));
    registry.register(Arc::new(PhishingFeedSource::new(feeds.clone())));
    registry.register(Arc::new(DomainBlocklistSource::new(feeds.clone())));
    registry.register(Arc::new(DarknetFeedSource::new(feeds.clone())));
    for source in &config.http_sources {
        let mut spec = builtin_spec(
            &source.name,
            SourceCategory::Reputation,
            2,
            TrustLevel::Medium,
            1.0,
        );
        if let Some(rpm) = source.rpm_override {
            spec.rate_limit.rpm = rpm;
        }
        registry.register(Arc::new(HttpReputationSource::new(
            spec,
            &source.endpoint,
            &source.api_key,
        )));
        info!(source = %source.name, "network reputation source enabled");
    }

    let cache = match &config.cache_dir {
        Some(dir) => IntelCache::with_disk(dir.clone()),
        None => IntelCache::in_memory(),
    };
    let fanout = Arc::new(FanoutEngine::new(registry, cache, FanoutConfig::default()));

    let vision: Arc<dyn VisionModel> = match &config.vision_url {
        Some(url) => Arc::new(RemoteVision::new(url, config.vision_api_key.as_deref())),
        None => {
            warn!("VISION_URL not set, vision analysis disabled");
            Arc::new(NoopVision)
        }
    };

    let security_modules: Vec<Arc<dyn SecurityModule>> = vec![
        Arc::new(TransportSecurityModule),
        Arc::new(PhishingBlocklistModule::new(feeds.clone())),
        Arc::new(FormCaptureModule),
    ];

    Collaborators {
        scout: Arc::new(HttpScout::new()),
        vision,
        security_modules,
        judge: Arc::new(DefaultJudgePolicy),
        fanout,
        feeds,
        reputation: Arc::new(Mutex::new(ReputationTracker::default())),
    }
}

fn audit_options(cli: &Cli) -> AuditOptions {
    AuditOptions {
        verdict_mode: Some(cli.verdict_mode.into()),
        enabled_security_modules: cli.security_modules.as_ref().map(|list| {
            list.split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect::<BTreeSet<_>>()
        }),
    }
}

/// Run one audit over the queue transport, returning the run plus the
/// event stream the supervisor reader observed.
async fn run_queue_pass(
    config: &AuditConfig,
    cli: &Cli,
    print_events: bool,
) -> Result<(Result<AuditRun, AuditError>, Vec<ProgressEvent>)> {
    let queue = EventQueue::bounded(forensics::transport::DEFAULT_CAPACITY);
    let emitter = Arc::new(ProgressEmitter::queue_mode(queue.clone(), StdoutSink::stdout()));

    let reader_queue = queue.clone();
    let reader_cancel = CancellationToken::new();
    let drain_cancel = reader_cancel.clone();
    let reader = tokio::spawn(async move {
        let mut reader = SupervisorReader::new(4096);
        let mut seen = Vec::new();
        reader
            .drain_queue(reader_queue, &drain_cancel, |ev| {
                if print_events {
                    tracing::debug!(event = %ev.event, phase = %ev.inner.phase, "supervisor event");
                }
                seen.push(ev.inner);
            })
            .await;
        seen
    });

    let orchestrator = Orchestrator::new(config.clone(), build_collaborators(config), emitter);
    install_ctrl_c(&orchestrator);
    let run = orchestrator
        .run(&cli.url, cli.tier.into(), audit_options(cli))
        .await;

    queue.close();
    let events = reader.await.context("supervisor reader panicked")?;
    reader_cancel.cancel();
    Ok((run, events))
}

/// Run one audit over the stdout transport. In validation mode the lines
/// go to an in-memory buffer so the stream can be compared.
async fn run_stdout_pass(
    config: &AuditConfig,
    cli: &Cli,
    capture: bool,
) -> Result<(Result<AuditRun, AuditError>, Vec<ProgressEvent>)> {
    use std::io::Write;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);
    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("buffer poisoned").extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let buffer = SharedBuf::default();
    let sink = if capture {
        StdoutSink::with_writer(Box::new(buffer.clone()))
    } else {
        StdoutSink::stdout()
    };
    let emitter = Arc::new(ProgressEmitter::stdout_mode(sink));
    let orchestrator = Orchestrator::new(config.clone(), build_collaborators(config), emitter);
    install_ctrl_c(&orchestrator);
    let run = orchestrator
        .run(&cli.url, cli.tier.into(), audit_options(cli))
        .await;

    let mut events = Vec::new();
    if capture {
        let contents = buffer.0.lock().expect("buffer poisoned").clone();
        let mut reader = SupervisorReader::new(4096);
        reader.drain_lines(&contents[..], |ev| events.push(ev.inner));
    }
    Ok((run, events))
}

fn install_ctrl_c(orchestrator: &Orchestrator) {
    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling audit");
            cancel.cancel();
        }
    });
}

fn finish(run: Result<AuditRun, AuditError>, pretty: bool) -> Result<ExitCode> {
    let run = match run {
        Ok(run) => run,
        Err(e @ AuditError::Input(_)) => {
            error!(error = %e, "invalid input");
            return Ok(ExitCode::from(2));
        }
        Err(e) => {
            error!(error = %e, "audit failed");
            return Ok(ExitCode::from(1));
        }
    };

    match run.status {
        AuditStatus::Aborted | AuditStatus::Error => Ok(ExitCode::from(1)),
        _ => {
            let report = run
                .report
                .context("completed audit produced no report")?;
            // The final result is the only non-sentinel stdout content.
            let json = if pretty {
                serde_json::to_string_pretty(&report)?
            } else {
                serde_json::to_string(&report)?
            };
            println!("{json}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = AuditConfig::default();

    let override_flag = if cli.validate_ipc {
        Some(ModeOverride::Validate)
    } else if cli.use_queue_ipc {
        Some(ModeOverride::ForceQueue)
    } else if cli.use_stdout {
        Some(ModeOverride::ForceStdout)
    } else {
        None
    };
    let selected = select_mode_from_env(override_flag, config.rollout_fraction);

    if selected.validate {
        let (queue_run, queue_events) = run_queue_pass(&config, &cli, false).await?;
        let (stdout_run, stdout_events) = run_stdout_pass(&config, &cli, true).await?;
        let diffs = compare_streams(&queue_events, &stdout_events);
        if diffs.is_empty() {
            info!(
                events = queue_events.len(),
                "transport validation passed: streams identical modulo timestamps"
            );
            drop(queue_run);
            return finish(stdout_run, cli.json);
        }
        for diff in &diffs {
            error!(diff = %diff.as_str(), "transport validation mismatch");
        }
        return Ok(ExitCode::from(1));
    }

    let run = match selected.mode {
        TransportMode::Queue => run_queue_pass(&config, &cli, true).await?.0,
        TransportMode::Stdout => run_stdout_pass(&config, &cli, false).await?.0,
    };
    finish(run, cli.json)
}
