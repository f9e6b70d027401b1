use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use config::Config as CConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

const CONFIG_FILE: &str = "config.toml";

// Upper bound on a single reply read. Replies are authorization responses
// of a few hundred bytes; the buffer is deliberately generous.
const MAX_REPLY_BYTES: usize = 1_024_000;

// A fully encoded 0200 authorization request. The engine never looks inside
// the payload; any byte sequence configured via `message` works the same.
const DEFAULT_MESSAGE: &str =
    "0200722004800000000016505050505050505050000000000001000001123456789012345678901234567890";

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::new(CONFIG_FILE).context("Error loading config")?;
    tracing_subscriber::fmt::init();

    let plan = Arc::new(DispatchPlan::try_from(config)?);

    println!("{}", "=".repeat(70));
    println!(
        "Server Address: {}, Port: {}\nVerbose: {}, Use TLS: {}\nQuantity: {}, Batch: {}, Total Messages to Send: {}",
        plan.address,
        plan.port,
        plan.verbose,
        plan.use_tls,
        plan.quantity,
        plan.batch,
        plan.total_planned()
    );
    println!("{}", "=".repeat(70));

    let transport: Arc<dyn Transport> = Arc::new(WireTransport::new(&plan));
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let runner = Runner::new(plan.clone(), transport, progress_tx);

    let _interrupt_signal = {
        // Translate the operator's interrupt into the run signal so in-flight
        // attempts drain and the final tally only counts finished attempts.
        let signal = runner.signal();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(_) => {
                    tracing::info!("Interrupt received, draining in-flight attempts");
                    signal.cancel();
                }
                Err(err) => {
                    // The OS failed to register the signal handler, so we
                    // can't react to interrupts. Log it and move on.
                    tracing::debug!("{}", err);
                }
            }
        })
    };

    let _display = {
        let verbose = plan.verbose;
        tokio::spawn(async move {
            while let Some(event) = progress_rx.recv().await {
                if verbose {
                    tracing::info!("Message: {}.....[{}]", event.completed, event.outcome);
                } else {
                    tracing::debug!("Message: {}.....[{}]", event.completed, event.outcome);
                }
            }
        })
    };

    let _heartbeat = {
        // Coarse progress line for non-verbose runs, on its own timer loop so
        // a loaded scheduler only delays it, never the attempts.
        let counters = runner.counters();
        let total = plan.total_planned();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                let counts = counters.snapshot();
                tracing::info!(
                    "Progress: {}/{} completed ({} success, {} failed)",
                    counts.completed,
                    total,
                    counts.success,
                    counts.failure
                );
            }
        })
    };

    let report = runner.run().await;

    println!("{}", "=".repeat(70));
    println!("{report}");
    println!("{}", "=".repeat(70));
    Ok(())
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
struct Config {
    log_level: String,
    address: String,
    port: u16,
    use_tls: bool,
    batch: u32,
    quantity: u32,
    verbose: bool,
    message: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl Config {
    fn new(path: &str) -> anyhow::Result<Self> {
        let config: Self = CConfig::builder()
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize()?;
        std::env::set_var("RUST_LOG", &config.log_level);
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            address: String::new(),
            port: 5005,
            use_tls: false,
            batch: 10,
            quantity: 100,
            verbose: false,
            message: DEFAULT_MESSAGE.to_string(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
        }
    }
}

// The resolved, validated plan for one run. Built once and shared read-only
// by every batch and attempt; quantity * batch is the planned total.
#[derive(Debug)]
struct DispatchPlan {
    address: String,
    port: u16,
    use_tls: bool,
    batch: u32,
    quantity: u32,
    verbose: bool,
    payload: Vec<u8>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl DispatchPlan {
    fn total_planned(&self) -> u64 {
        u64::from(self.quantity) * u64::from(self.batch)
    }
}

impl TryFrom<Config> for DispatchPlan {
    type Error = anyhow::Error;

    fn try_from(config: Config) -> Result<Self, Self::Error> {
        if config.address.trim().is_empty() {
            return Err(anyhow!("address must not be empty"));
        }
        if config.port == 0 {
            return Err(anyhow!("port must be a positive integer"));
        }
        if config.batch == 0 {
            return Err(anyhow!("batch must be at least 1"));
        }
        if config.quantity == 0 {
            return Err(anyhow!("quantity must be at least 1"));
        }
        if config.message.is_empty() {
            return Err(anyhow!("message must not be empty"));
        }
        Ok(Self {
            address: config.address,
            port: config.port,
            use_tls: config.use_tls,
            batch: config.batch,
            quantity: config.quantity,
            verbose: config.verbose,
            payload: config.message.into_bytes(),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Success,
    Failure,
}

impl AttemptOutcome {
    // Success means at least one byte came back. The reply content is not
    // inspected; this harness measures throughput, not correctness.
    fn from_reply(reply: &[u8]) -> Self {
        if reply.is_empty() {
            AttemptOutcome::Failure
        } else {
            AttemptOutcome::Success
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptOutcome::Success => write!(f, "OK"),
            AttemptOutcome::Failure => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counts {
    success: u64,
    failure: u64,
    completed: u64,
}

// One owned instance per run, shared by every attempt. A single mutex keeps
// the three counts in step, so a snapshot always satisfies
// success + failure == completed. The lock is only ever held for the
// increment itself, never across I/O.
#[derive(Debug, Default)]
struct RunCounters {
    counts: Mutex<Counts>,
}

impl RunCounters {
    // Returns the post-increment completed count, which doubles as the
    // attempt's sequence number in progress events.
    fn record(&self, outcome: AttemptOutcome) -> u64 {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            AttemptOutcome::Success => counts.success += 1,
            AttemptOutcome::Failure => counts.failure += 1,
        }
        counts.completed += 1;
        counts.completed
    }

    fn snapshot(&self) -> Counts {
        *self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    completed: u64,
    outcome: AttemptOutcome,
}

type ProgressSender = mpsc::UnboundedSender<Progress>;

// One attempt is exactly one connection lifecycle: connect, write the
// payload, read at most one reply, close. Implementations never return an
// error; any wire failure is an empty reply.
#[async_trait]
trait Transport: Send + Sync {
    async fn send(&self, plan: &DispatchPlan) -> Vec<u8>;
}

// Insecure trust mode for load testing: the server certificate is accepted
// unconditionally. This harness measures throughput, not trust chains.
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

fn insecure_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
        .with_no_client_auth()
}

// The production transport. Every attempt opens its own connection; there is
// no pooling, reuse or retry, so each attempt stands on its own in the tally.
struct WireTransport {
    tls: Option<TlsConnector>,
}

impl WireTransport {
    fn new(plan: &DispatchPlan) -> Self {
        let tls = plan
            .use_tls
            .then(|| TlsConnector::from(Arc::new(insecure_client_config())));
        Self { tls }
    }

    async fn exchange(&self, plan: &DispatchPlan) -> anyhow::Result<Vec<u8>> {
        let stream = timeout(
            plan.connect_timeout,
            TcpStream::connect((plan.address.as_str(), plan.port)),
        )
        .await
        .context("connect timed out")??;

        match &self.tls {
            Some(connector) => {
                let server_name = rustls::pki_types::ServerName::try_from(plan.address.clone())?;
                let stream = timeout(plan.connect_timeout, connector.connect(server_name, stream))
                    .await
                    .context("TLS handshake timed out")??;
                Self::roundtrip(stream, plan).await
            }
            None => Self::roundtrip(stream, plan).await,
        }
    }

    async fn roundtrip<S>(mut stream: S, plan: &DispatchPlan) -> anyhow::Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&plan.payload).await?;
        stream.flush().await?;
        let mut reply = vec![0u8; MAX_REPLY_BYTES];
        let n = timeout(plan.read_timeout, stream.read(&mut reply))
            .await
            .context("read timed out")??;
        reply.truncate(n);
        Ok(reply)
    }
}

#[async_trait]
impl Transport for WireTransport {
    // Connection errors, handshake failures and timeouts all collapse to an
    // empty reply here; failure is a valid measurement, not an exception.
    // The stream is dropped on every path, so no socket outlives its attempt.
    async fn send(&self, plan: &DispatchPlan) -> Vec<u8> {
        match self.exchange(plan).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::debug!("Attempt failed on the wire: {:#}", err);
                Vec::new()
            }
        }
    }
}

// Runs the B attempts of one batch concurrently. The batch returns only once
// every attempt it launched has finished; attempts never launched because
// the signal was set are not counted anywhere.
async fn run_batch(
    plan: Arc<DispatchPlan>,
    transport: Arc<dyn Transport>,
    counters: Arc<RunCounters>,
    signal: CancellationToken,
    progress_tx: ProgressSender,
    batch_index: u32,
) {
    let mut attempts = Vec::with_capacity(plan.batch as usize);
    for attempt_index in 0..plan.batch {
        if signal.is_cancelled() {
            break;
        }
        let plan = plan.clone();
        let transport = transport.clone();
        let counters = counters.clone();
        let signal = signal.clone();
        let progress_tx = progress_tx.clone();
        let attempt = tokio::spawn(async move {
            // Re-checked here because the task may first run well after it
            // was spawned; a cancelled attempt that never touched the wire
            // does not count as started.
            if signal.is_cancelled() {
                return;
            }
            let reply = transport.send(&plan).await;
            let outcome = AttemptOutcome::from_reply(&reply);
            let completed = counters.record(outcome);
            let _ = progress_tx.send(Progress { completed, outcome });
        });
        attempts.push((attempt_index, attempt));
    }
    for (attempt_index, attempt) in attempts {
        if let Err(err) = attempt.await {
            // A panicking attempt must not take its siblings down; it still
            // counts as one failed attempt in the tally.
            tracing::error!(
                "Attempt {} of batch {} aborted: {}",
                attempt_index,
                batch_index,
                err
            );
            let completed = counters.record(AttemptOutcome::Failure);
            let _ = progress_tx.send(Progress {
                completed,
                outcome: AttemptOutcome::Failure,
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Completed,
    Cancelled,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Completed => write!(f, "completed"),
            RunState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RunReport {
    state: RunState,
    elapsed: Duration,
    planned: u64,
    counts: Counts,
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Success Messages: {} and Failed Messages: {} in {:?} ({} of {} attempts, run {})",
            self.counts.success,
            self.counts.failure,
            self.elapsed,
            self.counts.completed,
            self.planned,
            self.state
        )
    }
}

// Drives one full run: records the start instant, fans out the batches,
// waits for the drain and produces the final report. The only shared-mutable
// state it hands out is the counters and the cancellation token.
struct Runner {
    plan: Arc<DispatchPlan>,
    transport: Arc<dyn Transport>,
    counters: Arc<RunCounters>,
    signal: CancellationToken,
    progress_tx: ProgressSender,
}

impl Runner {
    fn new(plan: Arc<DispatchPlan>, transport: Arc<dyn Transport>, progress_tx: ProgressSender) -> Self {
        Self {
            plan,
            transport,
            counters: Arc::new(RunCounters::default()),
            signal: CancellationToken::new(),
            progress_tx,
        }
    }

    // Cancelling the returned token stops new batches and attempts from
    // starting; attempts already on the wire run to completion.
    fn signal(&self) -> CancellationToken {
        self.signal.clone()
    }

    fn counters(&self) -> Arc<RunCounters> {
        self.counters.clone()
    }

    async fn run(&self) -> RunReport {
        let started = Instant::now();
        self.run_waves().await;
        let state = if self.signal.is_cancelled() {
            RunState::Cancelled
        } else {
            RunState::Completed
        };
        RunReport {
            state,
            elapsed: started.elapsed(),
            planned: self.plan.total_planned(),
            counts: self.counters.snapshot(),
        }
    }

    // Launches the Q batches as independent units and waits for all of them.
    // There is no lock around task creation: batches are independent and
    // their execution order carries no meaning.
    async fn run_waves(&self) {
        let mut batches = Vec::with_capacity(self.plan.quantity as usize);
        for batch_index in 0..self.plan.quantity {
            if self.signal.is_cancelled() {
                tracing::info!("Run signal set, no further batches will start");
                break;
            }
            batches.push(self.spawn_batch(batch_index));
            // Let already-issued batches get polled before the next launch;
            // a signal set by in-flight work is then seen between launches.
            tokio::task::yield_now().await;
        }
        for batch in batches {
            if let Err(err) = batch.await {
                tracing::error!("Batch task aborted: {}", err);
            }
        }
    }

    fn spawn_batch(&self, batch_index: u32) -> JoinHandle<()> {
        let plan = self.plan.clone();
        let transport = self.transport.clone();
        let counters = self.counters.clone();
        let signal = self.signal.clone();
        let progress_tx = self.progress_tx.clone();
        tokio::spawn(run_batch(
            plan,
            transport,
            counters,
            signal,
            progress_tx,
            batch_index,
        ))
    }
}
