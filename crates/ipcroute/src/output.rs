use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use ipcroute_wire::{Message, MessageKind};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    kind: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    method: &'a str,
    #[serde(skip_serializing_if = "is_zero")]
    id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ipcroute_wire::RpcError>,
    service: &'a str,
    timestamp: String,
}

fn is_zero(id: &i32) -> bool {
    *id == 0
}

/// Print one received message; `service` is the service it came from.
pub fn print_message(message: &Message, service: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                kind: kind_name(message.kind),
                method: &message.method,
                id: message.id,
                params: message.params.as_ref(),
                result: message.result.as_ref(),
                error: message.error.as_ref(),
                service,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KIND", "ID", "METHOD", "SERVICE", "BODY"])
                .add_row(vec![
                    kind_name(message.kind).to_string(),
                    message.id.to_string(),
                    message.method.clone(),
                    service.to_string(),
                    body(message),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{} id={} method={} service={} {}",
                kind_name(message.kind),
                message.id,
                message.method,
                service,
                body(message)
            );
        }
    }
}

pub fn kind_name(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Request => "request",
        MessageKind::Response => "response",
        MessageKind::Notification => "notification",
    }
}

/// The part of the message worth reading: error, result or params.
fn body(message: &Message) -> String {
    if let Some(error) = &message.error {
        return format!("error={error}");
    }
    let (label, value) = match message.kind {
        MessageKind::Response => ("result", message.result.as_ref()),
        _ => ("params", message.params.as_ref()),
    };
    match value {
        Some(value) => format!("{label}={value}"),
        None => format!("{label}=null"),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
