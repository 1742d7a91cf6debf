//! Records about the host and the container saved in the log collection.

use anyhow::{Context, Result};
use pkg_client::{ApiClient, SharedCollectionFs};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::Command;

/// Label and command line of one `node-info.txt` section.
pub type InfoCommand = (&'static str, Vec<String>);

pub fn host_info_commands(temp_dir: &Path) -> Vec<InfoCommand> {
    let tmp = temp_dir.display().to_string();
    let argv = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        ("Host Information", argv(&["uname", "-a"])),
        ("CPU Information", argv(&["cat", "/proc/cpuinfo"])),
        ("Memory Information", argv(&["cat", "/proc/meminfo"])),
        ("Disk Space", argv(&["df", "-m", "/", &tmp])),
        ("Disk INodes", argv(&["df", "-i", "/", &tmp])),
    ]
}

async fn write_file(fs: &SharedCollectionFs, name: &str, data: &[u8]) -> Result<()> {
    let mut fs = fs.lock().await;
    fs.create(name)?;
    fs.append(name, data)
}

/// Run each command and save labelled output as `node-info.txt`. Stops at
/// the first command that fails, keeping what was collected.
pub async fn log_host_info(
    fs: &SharedCollectionFs,
    commands: &[InfoCommand],
    env: &BTreeMap<String, String>,
) -> Result<()> {
    let mut out = Vec::new();
    let mut failed = None;
    for (label, argv) in commands {
        out.extend_from_slice(format!("{}\n", label).as_bytes());
        let Some((program, args)) = argv.split_first() else {
            continue;
        };
        let result = Command::new(program)
            .args(args)
            .env_clear()
            .envs(env)
            .output()
            .await;
        let err = match result {
            Ok(o) => {
                out.extend_from_slice(&o.stdout);
                out.extend_from_slice(&o.stderr);
                (!o.status.success()).then(|| o.status.to_string())
            }
            Err(e) => Some(e.to_string()),
        };
        if let Some(e) = err {
            let msg = format!("While running command {:?}: {}", argv, e);
            out.extend_from_slice(format!("{}\n", msg).as_bytes());
            failed = Some(msg);
            break;
        }
        out.push(b'\n');
    }
    write_file(fs, "node-info.txt", &out).await?;
    match failed {
        Some(msg) => anyhow::bail!(msg),
        None => Ok(()),
    }
}

fn to_indented_json(v: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let fmt = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
    v.serialize(&mut ser)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Save the container record, as the control plane returns it, as
/// `container.json`.
pub async fn log_container_record(api: &dyn ApiClient, fs: &SharedCollectionFs, uuid: &str) -> Result<()> {
    let raw = api
        .call_raw(
            "GET",
            "containers",
            "",
            "",
            json!({"filters": [["uuid", "=", uuid]]}),
        )
        .await
        .context("error getting container record")?;
    let resp: Value = serde_json::from_slice(&raw).context("error decoding container list response")?;
    let Some(items) = resp.get("items").and_then(Value::as_array) else {
        anyhow::bail!("error decoding container list response: no \"items\" key in API list response");
    };
    let Some(first) = items.first() else {
        anyhow::bail!("error: no container record found for {}", uuid);
    };
    write_file(fs, "container.json", &to_indented_json(first)?).await
}

/// Save the dispatcher's instance type description as `node.json`.
pub async fn log_node_record(fs: &SharedCollectionFs, instance_type: Option<&str>) -> Result<()> {
    match instance_type {
        Some(it) if !it.is_empty() => write_file(fs, "node.json", it.as_bytes()).await,
        _ => Ok(()),
    }
}
