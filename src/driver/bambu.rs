//! Bambu Lab printers in LAN mode.
//!
//! The printer runs an MQTT broker on port 8883 behind a self-signed TLS
//! certificate. One background task per printer drives the MQTT event loop,
//! re-subscribes and requests a full push after every (re)connect, and folds
//! incoming reports into a [`ReportCache`]. Facet calls only read that cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::report::{self, ReportCache};
use super::{
    ActionAck, Capabilities, ControlAction, DriverError, FilamentReport, PrinterDriver, RawStatus,
};

const MQTT_PORT: u16 = 8883;
const MQTT_USER: &str = "bblp";
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Full reports routinely exceed rumqttc's 10 KiB default.
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Connection settings for one printer.
#[derive(Debug, Clone)]
pub struct BambuConfig {
    /// Printer IP address or host name.
    pub host: String,
    pub serial: String,
    /// LAN-mode access code shown on the printer screen.
    pub access_code: String,
    /// How long `connect` waits for the MQTT session to come up.
    pub connect_timeout: Duration,
}

impl BambuConfig {
    pub fn new(host: impl Into<String>, serial: impl Into<String>, access_code: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            serial: serial.into(),
            access_code: access_code.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    fn report_topic(&self) -> String {
        format!("device/{}/report", self.serial)
    }

    fn request_topic(&self) -> String {
        format!("device/{}/request", self.serial)
    }
}

struct Session {
    client: AsyncClient,
    task: JoinHandle<()>,
}

pub struct BambuPrinter {
    config: BambuConfig,
    report: Arc<RwLock<ReportCache>>,
    online: Arc<watch::Sender<bool>>,
    session: Mutex<Option<Session>>,
}

impl BambuPrinter {
    pub fn new(config: BambuConfig) -> Self {
        let (online, _) = watch::channel(false);
        Self {
            config,
            report: Arc::new(RwLock::new(ReportCache::new())),
            online: Arc::new(online),
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BambuConfig {
        &self.config
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    fn start_session(&self) -> Session {
        let client_id = format!("printfarm_{}", Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, self.config.host.clone(), MQTT_PORT);
        options.set_credentials(MQTT_USER, self.config.access_code.clone());
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        options.set_transport(printer_tls_transport());

        let (client, event_loop) = AsyncClient::new(options, 64);
        let task = tokio::spawn(drive_session(
            event_loop,
            client.clone(),
            self.config.clone(),
            Arc::clone(&self.report),
            Arc::clone(&self.online),
        ));

        log::info!("[bambu {}] connecting to {}:{}", self.config.serial, self.config.host, MQTT_PORT);
        Session { client, task }
    }

    async fn wait_online(&self) -> Result<(), DriverError> {
        let mut online = self.online.subscribe();
        let waited = tokio::time::timeout(self.config.connect_timeout, online.wait_for(|up| *up))
            .await
            .map(|seen| seen.is_ok());
        match waited {
            Ok(true) => Ok(()),
            Ok(false) => Err(DriverError::NotConnected),
            Err(_) => Err(DriverError::Unreachable(format!(
                "no MQTT session with {} after {:?}",
                self.config.host, self.config.connect_timeout
            ))),
        }
    }

    async fn ensure_session(&self) {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.start_session());
        }
    }

    /// Facets fail fast while the session is down instead of waiting for it.
    async fn require_online(&self) -> Result<(), DriverError> {
        self.ensure_session().await;
        if self.is_online() {
            Ok(())
        } else {
            Err(DriverError::NotConnected)
        }
    }

    async fn client(&self) -> Result<AsyncClient, DriverError> {
        let session = self.session.lock().await;
        session
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or(DriverError::NotConnected)
    }
}

impl Drop for BambuPrinter {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.task.abort();
        }
    }
}

#[async_trait]
impl PrinterDriver for BambuPrinter {
    fn kind(&self) -> &'static str {
        "bambu"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn connect(&self) -> Result<(), DriverError> {
        self.ensure_session().await;
        self.wait_online().await
    }

    async fn status(&self) -> Result<RawStatus, DriverError> {
        self.require_online().await?;
        let cache = self.report.read().await;
        Ok(cache.report()?.raw_status())
    }

    async fn percentage(&self) -> Result<Option<f64>, DriverError> {
        self.require_online().await?;
        let cache = self.report.read().await;
        Ok(cache.report()?.mc_percent)
    }

    async fn filament(&self) -> Result<FilamentReport, DriverError> {
        self.require_online().await?;
        let cache = self.report.read().await;
        cache.filament()
    }

    async fn perform(&self, action: ControlAction) -> Result<ActionAck, DriverError> {
        self.require_online().await?;
        let client = self.client().await?;
        let payload = report::action_command(action).to_string();
        client
            .publish(self.config.request_topic(), QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| DriverError::CommandFailed(e.to_string()))?;
        log::info!("[bambu {}] sent {}", self.config.serial, action);
        Ok(ActionAck::sent(action))
    }
}

async fn drive_session(
    mut event_loop: EventLoop,
    client: AsyncClient,
    config: BambuConfig,
    report: Arc<RwLock<ReportCache>>,
    online: Arc<watch::Sender<bool>>,
) {
    let report_topic = config.report_topic();
    let request_topic = config.request_topic();

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                log::info!("[bambu {}] MQTT session established", config.serial);
                // Clean sessions drop subscriptions, so renew them on every ConnAck.
                if let Err(e) = client.try_subscribe(report_topic.clone(), QoS::AtMostOnce) {
                    log::warn!("[bambu {}] subscribe failed: {}", config.serial, e);
                }
                if let Err(e) = client.try_publish(
                    request_topic.clone(),
                    QoS::AtMostOnce,
                    false,
                    report::push_all().to_string(),
                ) {
                    log::warn!("[bambu {}] pushall request failed: {}", config.serial, e);
                }
                online.send_replace(true);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic == report_topic {
                    let mut cache = report.write().await;
                    if let Err(e) = cache.merge_payload(&publish.payload) {
                        log::debug!("[bambu {}] ignoring report: {}", config.serial, e);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                if online.send_replace(false) {
                    log::warn!("[bambu {}] connection lost: {}", config.serial, e);
                } else {
                    log::debug!("[bambu {}] connect attempt failed: {}", config.serial, e);
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn printer_tls_transport() -> Transport {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PrinterCertVerifier::new()))
        .with_no_client_auth();
    Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Printers present a per-device self-signed certificate, so the chain is
/// not checked. Handshake signatures still are.
#[derive(Debug)]
struct PrinterCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl PrinterCertVerifier {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PrinterCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
