use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Event, MqttOptions};
use rumqttc::Transport;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use super::NotificationBus;
use crate::violation::PersistedRecord;

/// Parsed MQTT broker endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `host:port`, `mqtt://host:port` or `mqtts://host:port`.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    // [::1]:1883
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

/// Publishes each persisted violation as JSON on `<prefix>/violations` (QoS 1).
///
/// The event loop runs on its own thread; publish only enqueues into the
/// client's request channel.
pub struct MqttNotificationBus {
    client: Client,
    topic: String,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttNotificationBus {
    pub fn connect(broker: &str, client_id: &str, topic_prefix: &str) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(broker)?;
        let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut connection) = Client::new(options, 10);
        let handle = std::thread::Builder::new()
            .name("mqtt-connection".to_string())
            .spawn(move || {
                for event in connection.iter() {
                    match event {
                        Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                        Err(e) => {
                            log::warn!("MQTT connection error: {}", e);
                            break;
                        }
                    }
                }
            })
            .context("spawn MQTT connection thread")?;

        log::info!(
            "MQTT notifications to {}:{} (TLS: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls
        );
        Ok(Self {
            client,
            topic: violations_topic(topic_prefix),
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn disconnect(&self) -> Result<()> {
        self.client.disconnect()?;
        let handle = self
            .connection_handle
            .lock()
            .map_err(|_| anyhow!("mqtt handle lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn violations_topic(prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        "violations".to_string()
    } else {
        format!("{}/violations", prefix)
    }
}

impl NotificationBus for MqttNotificationBus {
    fn publish(&self, record: &PersistedRecord) -> Result<()> {
        let payload = serde_json::to_vec(record).context("serialize violation payload")?;
        self.client
            .try_publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .map_err(|e| anyhow!("MQTT publish failed: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_schemed_endpoints() -> Result<()> {
        assert_eq!(
            parse_mqtt_endpoint("127.0.0.1:1883")?,
            MqttEndpoint {
                host: "127.0.0.1".to_string(),
                port: 1883,
                use_tls: false
            }
        );
        let tls = parse_mqtt_endpoint("mqtts://broker.local:8883")?;
        assert!(tls.use_tls);
        assert_eq!(tls.port, 8883);
        assert_eq!(parse_mqtt_endpoint("[::1]:1883")?.host, "::1");
        Ok(())
    }

    #[test]
    fn rejects_bad_endpoints() {
        assert!(parse_mqtt_endpoint("ws://broker:80").is_err());
        assert!(parse_mqtt_endpoint("broker").is_err());
        assert!(parse_mqtt_endpoint(":1883").is_err());
    }

    #[test]
    fn topic_prefix_is_normalized() {
        assert_eq!(violations_topic("rider_watch/"), "rider_watch/violations");
        assert_eq!(violations_topic(""), "violations");
    }
}
