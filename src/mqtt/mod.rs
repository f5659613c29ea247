//! MQTT bridge: republishes device events and presence to any number of
//! configured brokers.
//!
//! Each broker is an independent connection state machine (`pending` →
//! `connected` → `pending`) driven by its own event-loop task; see
//! [`broker`]. The bridge itself owns the broker set and the publish rules:
//!
//! - data plane: `<prefix><id>/<topic>`
//! - api plane: `<prefix><id>/api/<topic>` for records whose source line
//!   starts with the `#` control marker (marker stripped)
//!
//! Event lines carry `timestamp;topic;payload`; the timestamp is folded back
//! into the published payload so subscribers keep the device clock.

pub mod broker;

use std::path::PathBuf;

use rumqttc::{AsyncClient, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::daemon::CoreEvent;

/// Default MQTT broker port.
pub const DEFAULT_PORT: u16 = 1883;

/// Maximum length of a topic string (MQTT spec limit for UTF-8 strings).
pub const TOPIC_MAXLEN: usize = 65536;

/// Reserved headroom for the `/api/` infix between prefix+id and leaf.
const TOPIC_BASELEN: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("invalid broker address '{0}'")]
    Endpoint(String),
}

/// One configured MQTT endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub addr: String,
    pub port: u16,
    pub bind_addr: Option<String>,
    pub id: String,
    pub topic_prefix: String,
    pub ca_path: Option<PathBuf>,
}

impl BrokerConfig {
    /// Validates a broker descriptor, returning `None` (with a warning) for
    /// descriptors that must be skipped: a missing id after global-default
    /// fallback, a topic prefix not ending in `/`, or a prefix+id that could
    /// push topics past [`TOPIC_MAXLEN`].
    pub fn validated(
        addr: String,
        port: u16,
        bind_addr: Option<String>,
        id: Option<String>,
        topic_prefix: Option<String>,
        ca_path: Option<PathBuf>,
    ) -> Option<Self> {
        let Some(id) = id else {
            warn!("skipping broker {addr}:{port}: no ID was given");
            return None;
        };

        let topic_prefix = topic_prefix.unwrap_or_default();
        if !topic_prefix.is_empty() && !topic_prefix.ends_with('/') {
            warn!(
                "skipping broker {addr}:{port}: topic prefix '{topic_prefix}' does not end with '/'"
            );
            return None;
        }

        if topic_prefix.len() + id.len() + TOPIC_BASELEN > TOPIC_MAXLEN {
            warn!("skipping broker {addr}:{port}: topic prefix and id exceed the maximum topic length");
            return None;
        }

        Some(Self {
            addr,
            port,
            bind_addr,
            id,
            topic_prefix,
            ca_path,
        })
    }
}

/// Splits `ADDR[:PORT]` / `[V6ADDR][:PORT]` into host and port.
pub fn parse_endpoint(s: &str) -> Result<(String, u16), BrokerError> {
    let bad = || BrokerError::Endpoint(s.to_owned());

    if let Some(rest) = s.strip_prefix('[') {
        // IPv6 addresses are enclosed in []
        let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }
        let port = match tail.strip_prefix(':') {
            None if tail.is_empty() => DEFAULT_PORT,
            Some("") => DEFAULT_PORT,
            Some(port) => port.parse().map_err(|_| bad())?,
            None => return Err(bad()),
        };
        return Ok((host.to_owned(), port));
    }

    match s.split_once(':') {
        Some((host, "")) if !host.is_empty() => Ok((host.to_owned(), DEFAULT_PORT)),
        Some((host, port)) if !host.is_empty() => {
            Ok((host.to_owned(), port.parse().map_err(|_| bad())?))
        }
        None if !s.is_empty() => Ok((s.to_owned(), DEFAULT_PORT)),
        _ => Err(bad()),
    }
}

/// A publish queued towards one broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingPublish {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

/// Builds the final topic string, `None` when it would exceed the protocol
/// maximum.
pub fn build_topic(prefix: &str, id: &str, leaf: &str, api: bool) -> Option<String> {
    let topic = if api {
        format!("{prefix}{id}/api/{leaf}")
    } else {
        format!("{prefix}{id}/{leaf}")
    };
    if topic.len() > TOPIC_MAXLEN {
        warn!("dropping publish: topic exceeds maximum length of {TOPIC_MAXLEN}");
        return None;
    }
    Some(topic)
}

/// Splits a device event line into timestamp, topic suffix and payload.
pub fn split_event(line: &str) -> Option<(&str, &str, &str)> {
    let mut fields = line.splitn(3, ';');
    let timestamp = fields.next()?;
    let suffix = fields.next()?;
    let payload = fields.next()?;
    Some((timestamp, suffix, payload))
}

/// Maps one dump line onto its retained publish: `<key>;<value...>` goes to
/// the data plane, `#<key>;<value...>` to the api plane.
pub fn dump_publish(cfg: &BrokerConfig, line: &str) -> Option<OutgoingPublish> {
    let (key, value) = line.split_once(';')?;
    let (leaf, api) = match key.strip_prefix('#') {
        Some(stripped) => (stripped, true),
        None => (key, false),
    };
    Some(OutgoingPublish {
        topic: build_topic(&cfg.topic_prefix, &cfg.id, leaf, api)?,
        payload: value.to_owned(),
        qos: QoS::AtLeastOnce,
        retain: true,
    })
}

fn presence_publish(
    cfg: &BrokerConfig,
    phy: &str,
    added: bool,
    retain: bool,
) -> Option<OutgoingPublish> {
    Some(OutgoingPublish {
        topic: build_topic(&cfg.topic_prefix, &cfg.id, phy, false)?,
        payload: if added { "0;add" } else { "0;remove" }.to_owned(),
        qos: QoS::AtLeastOnce,
        retain,
    })
}

fn event_publish(cfg: &BrokerConfig, phy: &str, line: &str) -> Option<OutgoingPublish> {
    let (timestamp, suffix, payload) = split_event(line)?;
    Some(OutgoingPublish {
        topic: build_topic(&cfg.topic_prefix, &cfg.id, &format!("{phy}/{suffix}"), false)?,
        payload: format!("{timestamp};{payload}"),
        qos: QoS::AtMostOnce,
        retain: false,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerState {
    #[default]
    Pending,
    Connected,
}

struct Broker {
    cfg: BrokerConfig,
    client: Option<AsyncClient>,
    cancel: Option<CancellationToken>,
    state: BrokerState,
    init_done: bool,
}

/// Owns the broker set. Mutated only from the core loop; the per-broker
/// tasks report connectivity transitions as core events.
pub struct MqttBridge {
    brokers: Vec<Broker>,
}

impl MqttBridge {
    pub fn new(configs: Vec<BrokerConfig>) -> Self {
        let brokers = configs
            .into_iter()
            .map(|cfg| {
                info!(
                    "add broker {{addr: {}, port: {}, bind: {}, id: '{}', prefix: '{}'}}",
                    cfg.addr,
                    cfg.port,
                    cfg.bind_addr.as_deref().unwrap_or("::"),
                    cfg.id,
                    cfg.topic_prefix,
                );
                Broker {
                    cfg,
                    client: None,
                    cancel: None,
                    state: BrokerState::Pending,
                    init_done: false,
                }
            })
            .collect();
        Self { brokers }
    }

    /// Builds each broker's client identity and spawns its connection task.
    ///
    /// The tasks get their own cancellation tokens so [`shutdown`] can queue
    /// a graceful disconnect before stopping them.
    ///
    /// [`shutdown`]: MqttBridge::shutdown
    pub fn start(&mut self, events: mpsc::Sender<CoreEvent>) {
        for (index, b) in self.brokers.iter_mut().enumerate() {
            let cancel = CancellationToken::new();
            match broker::launch(index, &b.cfg, events.clone(), cancel.clone()) {
                Ok(client) => {
                    b.client = Some(client);
                    b.cancel = Some(cancel);
                }
                Err(e) => warn!("{}: broker setup failed: {e}", b.cfg.id),
            }
        }
    }

    /// Disconnects every connected broker with a normal disconnect (not the
    /// will) and stops the connection tasks.
    pub fn shutdown(&mut self) {
        for b in &mut self.brokers {
            if b.state == BrokerState::Connected {
                if let Some(client) = &b.client {
                    let _ = client.try_disconnect();
                }
            }
            if let Some(cancel) = &b.cancel {
                cancel.cancel();
            }
            b.state = BrokerState::Pending;
        }
    }

    /// Marks a broker connected and returns the publishes due on connect:
    /// the one-time retained presence + state dump for every known device,
    /// followed by non-retained presence markers for every known device.
    ///
    /// `phys` is the (name, dump lines) list in discovery order.
    pub fn on_connected(
        &mut self,
        index: usize,
        phys: &[(String, Vec<String>)],
    ) -> Vec<OutgoingPublish> {
        let Some(b) = self.brokers.get_mut(index) else {
            return Vec::new();
        };
        b.state = BrokerState::Connected;
        info!("{}: connected to {}:{}", b.cfg.id, b.cfg.addr, b.cfg.port);

        let mut publishes = Vec::new();
        if !b.init_done {
            for (phy, dump) in phys {
                publishes.extend(presence_publish(&b.cfg, phy, true, true));
                for line in dump {
                    publishes.extend(dump_publish(&b.cfg, line));
                }
            }
            b.init_done = true;
        }
        for (phy, _) in phys {
            publishes.extend(presence_publish(&b.cfg, phy, true, false));
        }
        publishes
    }

    /// Requeues a broker for reconnection; its task keeps retrying.
    pub fn on_disconnected(&mut self, index: usize) {
        if let Some(b) = self.brokers.get_mut(index) {
            if b.state == BrokerState::Connected {
                warn!(
                    "{}: lost connection to {}:{}",
                    b.cfg.id, b.cfg.addr, b.cfg.port
                );
            }
            b.state = BrokerState::Pending;
        }
    }

    pub fn state(&self, index: usize) -> Option<BrokerState> {
        self.brokers.get(index).map(|b| b.state)
    }

    /// Sends a prepared publish to one broker, fire-and-forget.
    pub fn send(&self, index: usize, publish: OutgoingPublish) {
        let Some(b) = self.brokers.get(index) else {
            return;
        };
        if let Some(client) = &b.client {
            if let Err(e) =
                client.try_publish(publish.topic, publish.qos, publish.retain, publish.payload)
            {
                debug!("{}: publish dropped: {e}", b.cfg.id);
            }
        }
    }

    /// Publishes one device event line to every connected broker.
    pub fn publish_event(&self, phy: &str, line: &str) {
        for (index, b) in self.brokers.iter().enumerate() {
            if b.state != BrokerState::Connected {
                continue;
            }
            if let Some(publish) = event_publish(&b.cfg, phy, line) {
                self.send(index, publish);
            }
        }
    }

    /// Publishes a retained presence record to every connected broker.
    pub fn publish_presence(&self, phy: &str, added: bool) {
        for (index, b) in self.brokers.iter().enumerate() {
            if b.state != BrokerState::Connected {
                continue;
            }
            if let Some(publish) = presence_publish(&b.cfg, phy, added, true) {
                self.send(index, publish);
            }
        }
    }

    /// Announces a newly added device: a broker that has not yet dumped any
    /// state catches up with this device's dump first, then everyone gets
    /// the retained presence record.
    pub fn publish_added(&mut self, phy: &str, dump: &[String]) {
        for index in 0..self.brokers.len() {
            let b = &mut self.brokers[index];
            if b.state != BrokerState::Connected {
                continue;
            }
            let mut publishes = Vec::new();
            if !b.init_done {
                for line in dump {
                    publishes.extend(dump_publish(&b.cfg, line));
                }
                b.init_done = true;
            }
            publishes.extend(presence_publish(&b.cfg, phy, true, true));
            for publish in publishes {
                self.send(index, publish);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(prefix: &str) -> BrokerConfig {
        BrokerConfig {
            addr: "broker.local".into(),
            port: DEFAULT_PORT,
            bind_addr: None,
            id: "ap1".into(),
            topic_prefix: prefix.into(),
            ca_path: None,
        }
    }

    #[test]
    fn validation_skips_broker_without_id() {
        assert!(BrokerConfig::validated("h".into(), 1883, None, None, None, None).is_none());
    }

    #[test]
    fn validation_requires_trailing_slash_on_prefix() {
        let bad = BrokerConfig::validated(
            "h".into(),
            1883,
            None,
            Some("ap1".into()),
            Some("site/rc".into()),
            None,
        );
        assert!(bad.is_none());

        let good = BrokerConfig::validated(
            "h".into(),
            1883,
            None,
            Some("ap1".into()),
            Some("site/rc/".into()),
            None,
        );
        assert_eq!(good.unwrap().topic_prefix, "site/rc/");
    }

    #[test]
    fn validation_bounds_prefix_and_id_length() {
        let long_prefix = format!("{}/", "p".repeat(TOPIC_MAXLEN));
        assert!(BrokerConfig::validated(
            "h".into(),
            1883,
            None,
            Some("ap1".into()),
            Some(long_prefix),
            None
        )
        .is_none());
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            parse_endpoint("10.0.0.1").unwrap(),
            ("10.0.0.1".into(), 1883)
        );
        assert_eq!(
            parse_endpoint("broker.local:8883").unwrap(),
            ("broker.local".into(), 8883)
        );
        assert_eq!(
            parse_endpoint("[fe80::1]").unwrap(),
            ("fe80::1".into(), 1883)
        );
        assert_eq!(
            parse_endpoint("[fe80::1]:8883").unwrap(),
            ("fe80::1".into(), 8883)
        );
        assert!(parse_endpoint("[fe80::1").is_err());
        assert!(parse_endpoint("host:notaport").is_err());
        assert!(parse_endpoint("").is_err());
    }

    #[test]
    fn topics_carry_prefix_id_and_api_infix() {
        assert_eq!(
            build_topic("site/", "ap1", "phy0/txs", false).unwrap(),
            "site/ap1/phy0/txs"
        );
        assert_eq!(
            build_topic("", "ap1", "version", true).unwrap(),
            "ap1/api/version"
        );
        assert!(build_topic("", "ap1", &"x".repeat(TOPIC_MAXLEN), false).is_none());
    }

    #[test]
    fn event_lines_split_into_topic_and_payload() {
        let publish = event_publish(&config("site/"), "phy0", "1694;txs;aa,bb;1,0").unwrap();
        assert_eq!(publish.topic, "site/ap1/phy0/txs");
        assert_eq!(publish.payload, "1694;aa,bb;1,0");
        assert_eq!(publish.qos, QoS::AtMostOnce);
        assert!(!publish.retain);

        // lines with fewer than three fields are dropped
        assert!(event_publish(&config(""), "phy0", "no-fields").is_none());
        assert!(event_publish(&config(""), "phy0", "ts;topic-only").is_none());
    }

    #[test]
    fn control_marker_routes_dump_lines_to_api_plane() {
        let api = dump_publish(&config(""), "#version;1;2").unwrap();
        assert_eq!(api.topic, "ap1/api/version");
        assert_eq!(api.payload, "1;2");
        assert!(api.retain);

        let data = dump_publish(&config(""), "group;0;rates").unwrap();
        assert_eq!(data.topic, "ap1/group");
        assert_eq!(data.payload, "0;rates");
    }

    #[test]
    fn reconnects_dump_exactly_once() {
        let mut bridge = MqttBridge::new(vec![config("")]);
        let phys = vec![(
            "phy0".to_string(),
            vec!["#version;1".to_string(), "group;0;r".to_string()],
        )];

        // two failed attempts keep the broker pending
        bridge.on_disconnected(0);
        bridge.on_disconnected(0);
        assert_eq!(bridge.state(0), Some(BrokerState::Pending));

        let first = bridge.on_connected(0, &phys);
        assert_eq!(bridge.state(0), Some(BrokerState::Connected));
        // retained presence, two dump lines, then the non-retained marker
        assert_eq!(first.len(), 4);
        assert!(first[0].retain);
        assert_eq!(first[1].topic, "ap1/api/version");
        assert_eq!(first[2].topic, "ap1/group");
        assert!(!first[3].retain);
        assert_eq!(first[3].payload, "0;add");

        bridge.on_disconnected(0);
        let again = bridge.on_connected(0, &phys);
        // no second dump, only the resync markers
        assert_eq!(again.len(), 1);
        assert!(!again[0].retain);
    }
}
