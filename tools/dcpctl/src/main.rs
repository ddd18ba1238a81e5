// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Operator CLI for the DCP daemons.
//!
//! ```bash
//! dcpctl bp list
//! dcpctl bp stats
//! dcpctl vardis create 7 --value aabb --descr altitude --rep 3
//! dcpctl vardis read 7
//! dcpctl vardis list
//! dcpctl srp neighbours
//! ```
//!
//! RTDB operations register a transient client application, perform the
//! request through shared memory, and deregister again: the same flow a
//! long-lived application would use.

use clap::{Parser, Subcommand};
use dcp::bp::wire::BpProtocolId;
use dcp::config::{DEFAULT_BP_SOCKET, DEFAULT_VARDIS_SOCKET};
use dcp::status::VardisStatus;
use dcp::vardis::messages::RtdbCreateRequest;
use dcp::vardis::wire::{VarId, VarSpec, VarValue};
use dcp::vardis::{VardisClient, VardisClientConfig};
use dcp::wire::WireString;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

/// Operator CLI for the DCP daemons.
#[derive(Parser, Debug)]
#[command(name = "dcpctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Request timeout in milliseconds
    #[arg(long, default_value = "1000")]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Beaconing Protocol daemon management
    Bp {
        /// BP command socket path
        #[arg(long, default_value = DEFAULT_BP_SOCKET)]
        socket: PathBuf,
        #[command(subcommand)]
        command: BpCommand,
    },
    /// Vardis daemon management and RTDB access
    Vardis {
        /// Vardis command socket path
        #[arg(long, default_value = DEFAULT_VARDIS_SOCKET)]
        socket: PathBuf,
        #[command(subcommand)]
        command: VardisCommand,
    },
    /// SRP neighbour table access
    Srp {
        /// SRP store shared-memory name
        #[arg(long, default_value = "/dcp-srp-store")]
        store: String,
        #[command(subcommand)]
        command: SrpCommand,
    },
}

#[derive(Subcommand, Debug)]
enum BpCommand {
    /// List registered client protocols
    List,
    /// Show beacon statistics
    Stats,
    /// Resume beacon emission
    Activate,
    /// Pause beacon emission
    Deactivate,
    /// Ask the daemon to exit
    Shutdown,
    /// Drop a protocol's buffered payloads
    ClearBuffer { protocol_id: u16 },
    /// Count a protocol's buffered payloads
    Query { protocol_id: u16 },
}

#[derive(Subcommand, Debug)]
enum VardisCommand {
    /// List all variables in the RTDB
    List,
    /// Show one variable in full detail
    Describe { var_id: u8 },
    /// Create a variable produced by this node
    Create {
        var_id: u8,
        /// Value bytes as hex (e.g. aabb01)
        #[arg(long)]
        value: String,
        /// Human-readable description
        #[arg(long, default_value = "")]
        descr: String,
        /// Repetition count (1..15)
        #[arg(long, default_value = "1")]
        rep: u8,
    },
    /// Update a variable produced by this node
    Update {
        var_id: u8,
        /// Value bytes as hex
        #[arg(long)]
        value: String,
    },
    /// Delete a variable produced by this node
    Delete { var_id: u8 },
    /// Read the local replica of a variable
    Read { var_id: u8 },
    /// Show protocol statistics
    Stats,
    /// Resume protocol processing
    Activate,
    /// Pause protocol processing
    Deactivate,
    /// Ask the daemon to exit
    Shutdown,
}

#[derive(Subcommand, Debug)]
enum SrpCommand {
    /// Dump the neighbour table
    Neighbours,
}

fn parse_hex(hex: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    if hex.len() % 2 != 0 {
        return Err("hex value must have an even number of digits".into());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| e.to_string().into()))
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn transient_client(socket: &PathBuf, timeout: Duration) -> Result<VardisClient, Box<dyn Error>> {
    let pid = std::process::id();
    let config = VardisClientConfig {
        command_socket_path: socket.clone(),
        command_timeout: timeout,
        client_name: format!("dcpctl-{pid}"),
        shm_name: format!("/dcp-vardis-dcpctl-{pid}"),
    };
    Ok(VardisClient::register(&config)?)
}

fn run_bp(socket: &PathBuf, timeout: Duration, command: BpCommand) -> Result<(), Box<dyn Error>> {
    use dcp::bp::client as bp;
    match command {
        BpCommand::List => {
            let confirm = bp::list_registered_protocols(socket, timeout)?;
            println!(
                "BP is {} with {} registered protocol(s)",
                if confirm.bp_is_active { "active" } else { "inactive" },
                confirm.protocols.len()
            );
            for p in confirm.protocols {
                println!(
                    "  {}  {:<16} mode={} maxPayload={} out={} in={} dropOut={} dropIn={}",
                    p.protocol_id,
                    p.protocol_name.to_string_lossy(),
                    p.queueing_mode,
                    p.max_payload_size,
                    p.cnt_outgoing_payloads,
                    p.cnt_received_payloads,
                    p.cnt_dropped_outgoing_payloads,
                    p.cnt_dropped_incoming_payloads,
                );
            }
        }
        BpCommand::Stats => {
            let s = bp::get_statistics(socket, timeout)?;
            println!("beacons sent:      {}", s.cnt_beacons_sent);
            println!("beacons received:  {}", s.cnt_beacons_received);
            println!("avg beacon size:   {:.1} B", s.avg_beacon_size);
            println!("avg inter-beacon:  {:.1} ms", s.avg_inter_beacon_time_ms);
            println!("dropped unknown:   {}", s.cnt_dropped_unknown);
            println!("dropped incoming:  {}", s.cnt_dropped_incoming);
            println!("dropped outgoing:  {}", s.cnt_dropped_outgoing);
        }
        BpCommand::Activate => println!("{}", bp::activate(socket, timeout)?),
        BpCommand::Deactivate => println!("{}", bp::deactivate(socket, timeout)?),
        BpCommand::Shutdown => println!("{}", bp::shutdown(socket, timeout)?),
        BpCommand::ClearBuffer { protocol_id } => {
            println!(
                "{}",
                bp::clear_buffer(socket, timeout, BpProtocolId(protocol_id))?
            );
        }
        BpCommand::Query { protocol_id } => {
            let confirm =
                bp::query_buffered_payloads(socket, timeout, BpProtocolId(protocol_id))?;
            println!("{}: {} payload(s) buffered", confirm.status, confirm.num_payloads_buffered);
        }
    }
    Ok(())
}

fn run_vardis(
    socket: &PathBuf,
    timeout: Duration,
    command: VardisCommand,
) -> Result<(), Box<dyn Error>> {
    use dcp::vardis::client as vardis;
    match command {
        VardisCommand::List => {
            let confirm = vardis::describe_database(socket, timeout)?;
            println!(
                "Vardis is {} with {} variable(s)",
                if confirm.vardis_is_active { "active" } else { "inactive" },
                confirm.variables.len()
            );
            for v in confirm.variables {
                println!(
                    "  {:>3}  producer={} seqno={} len={} {}{}",
                    v.spec.var_id,
                    v.spec.producer,
                    v.seqno,
                    v.value_length,
                    v.spec.description.to_string_lossy(),
                    if v.to_be_deleted { "  (deleting)" } else { "" },
                );
            }
        }
        VardisCommand::Describe { var_id } => {
            let confirm = vardis::describe_variable(socket, timeout, VarId(var_id))?;
            if confirm.status != VardisStatus::Ok {
                println!("{}", confirm.status);
                return Ok(());
            }
            println!("variable    {}", confirm.spec.var_id);
            println!("producer    {}", confirm.spec.producer);
            println!("description {}", confirm.spec.description.to_string_lossy());
            println!("repCnt      {}", confirm.spec.rep_cnt);
            println!("seqno       {}", confirm.seqno);
            println!("timestamp   {}", confirm.timestamp);
            println!("deleting    {}", confirm.to_be_deleted);
            println!(
                "counters    create={} update={} delete={}",
                confirm.count_create, confirm.count_update, confirm.count_delete
            );
            println!("value       {}", to_hex(confirm.value.as_bytes()));
        }
        VardisCommand::Create {
            var_id,
            value,
            descr,
            rep,
        } => {
            let client = transient_client(socket, timeout)?;
            let request = RtdbCreateRequest {
                spec: VarSpec {
                    var_id: VarId(var_id),
                    producer: client.node_id(),
                    rep_cnt: rep,
                    description: WireString::new(descr.as_bytes())
                        .map_err(|e| e.to_string())?,
                },
                value: VarValue::new(&parse_hex(&value)?).map_err(|e| e.to_string())?,
            };
            let status = client.rtdb_create(&request, timeout)?;
            println!("{status}");
            client.deregister()?;
        }
        VardisCommand::Update { var_id, value } => {
            let client = transient_client(socket, timeout)?;
            let status = client.rtdb_update(VarId(var_id), &parse_hex(&value)?, timeout)?;
            println!("{status}");
            client.deregister()?;
        }
        VardisCommand::Delete { var_id } => {
            let client = transient_client(socket, timeout)?;
            let status = client.rtdb_delete(VarId(var_id), timeout)?;
            println!("{status}");
            client.deregister()?;
        }
        VardisCommand::Read { var_id } => {
            let client = transient_client(socket, timeout)?;
            let confirm = client.rtdb_read(VarId(var_id), 255, timeout)?;
            if confirm.status == VardisStatus::Ok {
                println!(
                    "seqno={} timestamp={} value={}",
                    confirm.seqno,
                    confirm.timestamp,
                    to_hex(confirm.value.as_bytes())
                );
            } else {
                println!("{}", confirm.status);
            }
            client.deregister()?;
        }
        VardisCommand::Stats => {
            let confirm = vardis::get_statistics(socket, timeout)?;
            let c = confirm.counters;
            println!("RTDB requests:       create={} update={} delete={} read={}",
                c.rtdb_create_requests, c.rtdb_update_requests,
                c.rtdb_delete_requests, c.rtdb_read_requests);
            println!("payloads:            generated={} processed={}",
                c.payloads_generated, c.payloads_processed);
            println!("records processed:   creates={} deletes={} updates={}",
                c.processed_creates, c.processed_deletes, c.processed_updates);
            println!("                     summaries={} reqCreates={} reqUpdates={}",
                c.processed_summaries, c.processed_req_creates, c.processed_req_updates);
        }
        VardisCommand::Activate => println!("{}", vardis::activate(socket, timeout)?),
        VardisCommand::Deactivate => println!("{}", vardis::deactivate(socket, timeout)?),
        VardisCommand::Shutdown => println!("{}", vardis::shutdown(socket, timeout)?),
    }
    Ok(())
}

fn run_srp(store: &str, command: SrpCommand) -> Result<(), Box<dyn Error>> {
    match command {
        SrpCommand::Neighbours => {
            let client = dcp::srp::SrpClient::attach(store)?;
            let neighbours = client.neighbours()?;
            println!("{} neighbour(s)", neighbours.len());
            for n in neighbours {
                println!(
                    "  {}  seq={} last-heard={} pos=({:.1}, {:.1}, {:.1}) vel=({:.1}, {:.1}, {:.1})",
                    n.node_id,
                    n.seqno,
                    n.timestamp,
                    n.safety_data.position_x,
                    n.safety_data.position_y,
                    n.safety_data.position_z,
                    n.safety_data.velocity_x,
                    n.safety_data.velocity_y,
                    n.safety_data.velocity_z,
                );
            }
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout);
    match args.command {
        Command::Bp { socket, command } => run_bp(&socket, timeout, command),
        Command::Vardis { socket, command } => run_vardis(&socket, timeout, command),
        Command::Srp { store, command } => run_srp(&store, command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("aabb01").unwrap(), vec![0xaa, 0xbb, 0x01]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0xde, 0xad, 0x01]), "dead01");
    }
}
