//! Syslog emission: one datagram per result row.

use crate::row::{filter_rows, format_value, sort_rows};
use benchflow_core::{BenchError, Result, RowSet, SyslogSpec, DEFAULT_SYSLOG_PORT};
use benchflow_logic::substitute_fixpoint;
use std::net::UdpSocket;
use tracing::debug;

/// Syslog priority: facility user (1), severity informational (6).
const PRIORITY: u8 = 14;

/// Send one record per row to the configured UDP address or unix datagram
/// socket. Returns the number of records sent.
pub fn emit_syslog(rowset: &RowSet, spec: &SyslogSpec, result_name: &str) -> Result<usize> {
    let rows = filter_rows(rowset.rows.clone(), spec.filter.as_deref())?;
    let mut rows = rows;
    sort_rows(&mut rows, &spec.sort, &rowset.types);

    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        let payload = match &spec.format {
            Some(template) => substitute_fixpoint(template, row)?,
            None => {
                let mut fields = Vec::new();
                for key in &spec.keys {
                    if let Some(value) = row.get(&key.key) {
                        let value = format_value(value, key.format.as_deref())?;
                        fields.push(format!("{}={}", key.header(), value));
                    }
                }
                fields.join(" ")
            }
        };
        records.push(format!("<{PRIORITY}>benchflow[{result_name}]: {payload}"));
    }

    match (&spec.socket_path, &spec.address) {
        (Some(path), _) => send_unix(path, &records),
        (None, Some(address)) => send_udp(address, &records),
        (None, None) => Err(BenchError::Config(format!(
            "syslog result '{result_name}' needs an address or socket path"
        ))),
    }
}

fn send_udp(address: &str, records: &[String]) -> Result<usize> {
    let target = if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_SYSLOG_PORT}")
    };
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| BenchError::io("binding syslog socket", e))?;
    for record in records {
        socket
            .send_to(record.as_bytes(), &target)
            .map_err(|e| BenchError::io(format!("sending syslog record to {target}"), e))?;
    }
    debug!(count = records.len(), target = %target, "sent syslog records");
    Ok(records.len())
}

#[cfg(unix)]
fn send_unix(path: &str, records: &[String]) -> Result<usize> {
    use std::os::unix::net::UnixDatagram;
    let socket =
        UnixDatagram::unbound().map_err(|e| BenchError::io("creating unix datagram", e))?;
    for record in records {
        socket
            .send_to(record.as_bytes(), path)
            .map_err(|e| BenchError::io(format!("sending syslog record to {path}"), e))?;
    }
    debug!(count = records.len(), path = %path, "sent syslog records");
    Ok(records.len())
}

#[cfg(not(unix))]
fn send_unix(path: &str, _records: &[String]) -> Result<usize> {
    Err(BenchError::Config(format!(
        "unix socket syslog ('{path}') is unsupported on this platform"
    )))
}
