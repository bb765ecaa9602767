use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::future::join_all;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use rust_cast::CastDevice;
use serde_json::Value as JsonValue;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::{CastError, Device, Result};

/// Service type Cast receivers advertise over mDNS
pub const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

/// Default Cast control port
pub const DEFAULT_CAST_PORT: u16 = 8009;

/// Port of the receiver's local setup API (`eureka_info`)
const SETUP_API_PORT: u16 = 8008;

/// Devices collected during one discovery pass, first-seen wins.
#[derive(Debug, Default)]
pub struct DiscoveryPass {
    seen: HashSet<String>,
    devices: Vec<Device>,
}

impl DiscoveryPass {
    /// Record a device. Returns false if its id was already seen in this pass.
    pub fn offer(&mut self, device: Device) -> bool {
        if !self.seen.insert(device.id.clone()) {
            return false;
        }
        self.devices.push(device);
        true
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn into_devices(self) -> Vec<Device> {
        self.devices
    }
}

/// Finds Cast receivers on the local network.
pub struct DeviceScanner {
    default_timeout: Duration,
    probe_timeout: Duration,
    http: reqwest::Client,
}

impl DeviceScanner {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            default_timeout: config.timeout(),
            probe_timeout: config.probe_timeout(),
            http: reqwest::Client::new(),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Browse for receivers for `timeout`. Finding nothing is not an error.
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<Device>> {
        info!("Discovering Cast devices for {:?}", timeout);

        let mdns = ServiceDaemon::new()
            .map_err(|e| CastError::Discovery(format!("Failed to create mDNS daemon: {}", e)))?;

        let receiver = match mdns.browse(CAST_SERVICE_TYPE) {
            Ok(receiver) => receiver,
            Err(e) => {
                let _ = mdns.shutdown();
                return Err(CastError::Discovery(format!(
                    "Failed to browse {}: {}",
                    CAST_SERVICE_TYPE, e
                )));
            }
        };

        let deadline = Instant::now() + timeout;
        let mut pass = DiscoveryPass::default();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match time::timeout(remaining, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    let Some(device) = device_from_service(&info) else {
                        continue;
                    };
                    let (name, address, port) = (device.display_name.clone(), device.address, device.port);
                    if pass.offer(device) {
                        info!("Found Cast device: {} at {}:{}", name, address, port);
                    } else {
                        debug!("Ignoring duplicate report of {} at {}", name, address);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) => {
                    warn!("mDNS browse channel closed early");
                    break;
                }
                Err(_) => break,
            }
        }

        if let Err(e) = mdns.stop_browse(CAST_SERVICE_TYPE) {
            debug!("Failed to stop mDNS browse: {}", e);
        }
        if let Err(e) = mdns.shutdown() {
            debug!("Failed to shut down mDNS daemon: {}", e);
        }

        let devices = join_all(pass.into_devices().into_iter().map(|d| self.enrich(d))).await;

        if devices.is_empty() {
            info!("No Cast devices found on the network");
        } else {
            info!("Found {} Cast device(s)", devices.len());
        }
        Ok(devices)
    }

    /// Bounded TCP connect followed by a Cast handshake. Never errors.
    pub async fn verify_reachable(&self, address: IpAddr, port: u16) -> bool {
        let addr = SocketAddr::new(address, port);

        match time::timeout(self.probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("Device {} refused connection: {}", addr, e);
                return false;
            }
            Err(_) => {
                debug!("Device {} did not accept a connection within {:?}", addr, self.probe_timeout);
                return false;
            }
        }

        // The probe thread may outlive a timeout; it ends when the socket does.
        let host = address.to_string();
        let probe = tokio::task::spawn_blocking(move || -> std::result::Result<(), String> {
            let device = CastDevice::connect_without_host_verification(host, port)
                .map_err(|e| e.to_string())?;
            device
                .connection
                .connect("receiver-0")
                .map_err(|e| e.to_string())?;
            device.receiver.get_status().map_err(|e| e.to_string())?;
            Ok(())
        });

        match time::timeout(self.probe_timeout, probe).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                warn!("Device verification failed for {}: {}", addr, e);
                false
            }
            Ok(Err(e)) => {
                warn!("Device verification task failed for {}: {}", addr, e);
                false
            }
            Err(_) => {
                warn!("Device verification timed out for {}", addr);
                false
            }
        }
    }

    /// Fill in manufacturer and model from the receiver's setup API.
    async fn enrich(&self, mut device: Device) -> Device {
        let url = format!(
            "http://{}/setup/eureka_info?options=detail",
            SocketAddr::new(device.address, SETUP_API_PORT)
        );

        let info = match time::timeout(self.probe_timeout, self.fetch_json(&url)).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                debug!("No device info for {}: {}", device.display_name, e);
                return device;
            }
            Err(_) => {
                debug!("Device info request for {} timed out", device.display_name);
                return device;
            }
        };

        apply_device_info(&mut device, &info);
        device
    }

    async fn fetch_json(&self, url: &str) -> std::result::Result<JsonValue, reqwest::Error> {
        self.http.get(url).send().await?.error_for_status()?.json().await
    }
}

fn device_from_service(info: &ServiceInfo) -> Option<Device> {
    let addresses = info.get_addresses();
    let address = addresses
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addresses.iter().next())
        .copied();

    let Some(address) = address else {
        warn!("No IP address found for device: {}", info.get_fullname());
        return None;
    };

    let txt: HashMap<String, String> = ["id", "fn", "md"]
        .iter()
        .filter_map(|key| {
            info.get_properties()
                .get(key)
                .map(|v| (key.to_string(), v.val_str().to_string()))
        })
        .collect();

    Some(device_from_txt(info.get_fullname(), &txt, address, info.get_port()))
}

/// Build a device from its mDNS instance name and Cast TXT records.
pub(crate) fn device_from_txt(
    fullname: &str,
    txt: &HashMap<String, String>,
    address: IpAddr,
    port: u16,
) -> Device {
    let instance = fullname
        .strip_suffix(CAST_SERVICE_TYPE)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname);

    let non_empty = |key: &str| txt.get(key).filter(|v| !v.is_empty()).cloned();

    let model_name = non_empty("md").unwrap_or_else(|| "Unknown model".to_string());
    Device {
        id: non_empty("id").unwrap_or_else(|| instance.to_string()),
        display_name: non_empty("fn").unwrap_or_else(|| instance.to_string()),
        manufacturer: manufacturer_from_model(&model_name).to_string(),
        model_name,
        address,
        port,
    }
}

fn manufacturer_from_model(model: &str) -> &'static str {
    let model = model.to_lowercase();
    if ["chromecast", "google", "nest"].iter().any(|m| model.contains(m)) {
        "Google Inc."
    } else {
        "Unknown manufacturer"
    }
}

/// Newer firmware nests details under `device_info`, older under `detail`.
fn apply_device_info(device: &mut Device, info: &JsonValue) {
    let details = info
        .get("device_info")
        .or_else(|| info.get("detail"))
        .unwrap_or(&JsonValue::Null);

    if let Some(manufacturer) = details.get("manufacturer").and_then(JsonValue::as_str) {
        device.manufacturer = manufacturer.to_string();
    }
    if let Some(model) = details.get("model_name").and_then(JsonValue::as_str) {
        device.model_name = model.to_string();
    }
}
