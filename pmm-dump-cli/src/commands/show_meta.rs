//! The `show-meta` command: inspect a dump without touching any server.

use crate::commands::CommonOpts;
use anyhow::Result;
use pmm_dump_core::meta::{byte_count_binary, byte_count_decimal};
use pmm_dump_core::{read_meta, DumpError, Meta};
use std::fs::File;
use std::io::IsTerminal;

pub fn show_meta(common: &CommonOpts, prettify: bool) -> Result<()> {
    let meta = match &common.dump_path {
        Some(path) => read_meta(
            File::open(path).map_err(|e| DumpError::Io { path: path.clone(), source: e })?,
        )?,
        None if !std::io::stdin().is_terminal() => read_meta(std::io::stdin())?,
        None => {
            return Err(DumpError::Config {
                reason: "specify the path to the dump file with --dump-path".into(),
            }
            .into())
        }
    };

    if prettify {
        print_pretty(&meta);
    } else {
        println!("{}", serde_json::to_string_pretty(&meta)?);
    }
    Ok(())
}

fn print_pretty(meta: &Meta) {
    println!("Build: {}", meta.version.git_commit);
    println!("PMM Version: {}", meta.pmm_server_version);
    println!(
        "Max Chunk Size: {} ({})",
        byte_count_decimal(meta.max_chunk_size),
        byte_count_binary(meta.max_chunk_size)
    );
    if let Some(tz) = &meta.pmm_timezone {
        println!("PMM Timezone: {tz}");
    }
    println!("Arguments: {}", meta.arguments);
    if !meta.pmm_server_services.is_empty() {
        println!("Services:");
        for service in &meta.pmm_server_services {
            println!("\t- Name: {}", service.name);
            println!("\t  Node ID: {}", service.node_id);
            println!("\t  Node Name: {}", service.node_name);
            println!("\t  Agents ID: {:?}", service.agents_ids);
        }
    }
}
