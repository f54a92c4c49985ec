//! RAUC binding over the D-Bus system bus

use super::traits::Installer;
use crate::bus::{BusEvent, BusValue, EventPusher};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};
use zbus::zvariant::{OwnedValue, Value};
use zbus::{Connection, MatchRule, Message, MessageStream, Proxy};

/// Well-known bus name of the RAUC service
pub const RAUC_SERVICE: &str = "de.pengutronix.rauc";

/// RAUC installer interface
pub const INSTALLER_INTERFACE: &str = "de.pengutronix.rauc.Installer";

/// Object path of the installer
pub const INSTALLER_PATH: &str = "/";

/// Installer calling `de.pengutronix.rauc.Installer.Install`
pub struct RaucInstaller {
    proxy: Proxy<'static>,
}

impl RaucInstaller {
    /// Create a proxy for the RAUC installer on `connection`
    pub async fn connect(connection: &Connection) -> Result<Self> {
        let proxy = Proxy::new(connection, RAUC_SERVICE, INSTALLER_PATH, INSTALLER_INTERFACE)
            .await
            .context("Failed to create RAUC installer proxy")?;
        Ok(Self { proxy })
    }
}

#[async_trait]
impl Installer for RaucInstaller {
    async fn install(&self, bundle: &Path) -> Result<()> {
        let bundle = bundle.to_string_lossy().into_owned();
        debug!("Calling {}.Install({})", INSTALLER_INTERFACE, bundle);
        self.proxy
            .call_method("Install", &(bundle,))
            .await
            .context("RAUC refused the install request")?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "RAUC"
    }
}

/// Forward every signal emitted by the RAUC service into the bridge until
/// the bus connection closes
pub async fn forward_signals(connection: Connection, pusher: EventPusher) -> Result<()> {
    let rule = MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .sender(RAUC_SERVICE)?
        .build();
    let mut stream = MessageStream::for_match_rule(rule, &connection, None)
        .await
        .context("Failed to subscribe to RAUC signals")?;

    info!("Listening for {} signals", RAUC_SERVICE);

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable bus message: {}", e);
                continue;
            }
        };

        match to_bus_event(&message) {
            Some(event) => {
                if !pusher.push(event) {
                    break;
                }
            }
            None => debug!("Ignoring bus message without interface or member"),
        }
    }

    Ok(())
}

fn to_bus_event(message: &Message) -> Option<BusEvent> {
    let header = message.header();
    let interface = header.interface()?.to_string();
    let member = header.member()?.to_string();
    let object_path = header
        .path()
        .map(|path| path.to_string())
        .unwrap_or_else(|| INSTALLER_PATH.to_string());
    let sender = header.sender().map(|sender| sender.to_string());

    let args = if interface == crate::bus::PROPERTIES_INTERFACE {
        properties_changed_args(message)
    } else if member == "Completed" {
        match message.body().deserialize::<(i32,)>() {
            Ok((code,)) => vec![BusValue::Int(code as i64)],
            Err(e) => {
                warn!("Malformed Completed signal: {}", e);
                return None;
            }
        }
    } else {
        Vec::new()
    };

    Some(BusEvent {
        sender,
        object_path,
        interface,
        member,
        args,
    })
}

fn properties_changed_args(message: &Message) -> Vec<BusValue> {
    let body = message.body();
    let decoded = body.deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>();
    let Ok((interface, changed, invalidated)) = decoded else {
        return Vec::new();
    };

    let changed = changed
        .iter()
        .map(|(name, value)| (name.clone(), from_value(value)))
        .collect();
    let invalidated = invalidated.into_iter().map(BusValue::Str).collect();

    vec![
        BusValue::Str(interface),
        BusValue::Dict(changed),
        BusValue::Array(invalidated),
    ]
}

fn from_value(value: &Value<'_>) -> BusValue {
    match value {
        Value::Bool(b) => BusValue::Bool(*b),
        Value::U8(n) => BusValue::Int(*n as i64),
        Value::I16(n) => BusValue::Int(*n as i64),
        Value::U16(n) => BusValue::Int(*n as i64),
        Value::I32(n) => BusValue::Int(*n as i64),
        Value::U32(n) => BusValue::Int(*n as i64),
        Value::I64(n) => BusValue::Int(*n),
        Value::U64(n) => BusValue::Int(*n as i64),
        Value::Str(s) => BusValue::Str(s.to_string()),
        Value::Structure(structure) => {
            BusValue::Tuple(structure.fields().iter().map(from_value).collect())
        }
        Value::Array(array) => BusValue::Array(array.inner().iter().map(from_value).collect()),
        Value::Value(inner) => from_value(inner),
        _ => BusValue::Unsupported,
    }
}
