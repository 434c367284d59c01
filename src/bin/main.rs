// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use lamport_ledger::{
    AccountId, AllHistory, Simulation, SimulationConfig, SimulationReport, TransferOrder,
    ring_transfers,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Sharded ledger simulation
///
/// Spawns one account per balance, runs a transfer plan through the shard
/// router and prints per-shard statistics to stdout as CSV.
#[derive(Parser, Debug)]
#[command(name = "lamport-ledger")]
#[command(about = "Runs a sharded ledger simulation with Lamport-ordered transfers", long_about = None)]
struct Args {
    /// Initial balance per account, comma separated. Account ids start at 1.
    #[arg(long, value_delimiter = ',', value_name = "AMOUNTS")]
    balances: Vec<Decimal>,

    /// Number of shard workers
    #[arg(long, value_name = "N")]
    shards: Option<usize>,

    /// Bound on each acknowledgment wait, 0 waits forever
    #[arg(long, value_name = "MS")]
    ack_timeout_ms: Option<u64>,

    /// Path to CSV file with transfers
    ///
    /// Expected format: source,destination,amount
    /// Without it every account sends to the next one in a ring.
    #[arg(long, value_name = "FILE")]
    plan: Option<PathBuf>,

    /// Also print every account's balance history
    #[arg(long)]
    histories: bool,
}

impl Args {
    fn config(&self) -> SimulationConfig {
        let mut config = SimulationConfig::default();
        if !self.balances.is_empty() {
            config.balances = self.balances.clone();
        }
        if let Some(shards) = self.shards {
            config.shard_count = shards;
        }
        match self.ack_timeout_ms {
            Some(0) => config.ack_timeout_ms = None,
            Some(ms) => config.ack_timeout_ms = Some(ms),
            None => {}
        }
        config
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.config();

    let plan = match &args.plan {
        Some(path) => {
            let file = match File::open(path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Error opening file '{}': {}", path.display(), e);
                    process::exit(1);
                }
            };
            match read_plan(BufReader::new(file)) {
                Ok(plan) => plan,
                Err(e) => {
                    eprintln!("Error reading plan: {}", e);
                    process::exit(1);
                }
            }
        }
        None => ring_transfers(config.account_count()),
    };

    let simulation = match Simulation::new(config) {
        Ok(simulation) => simulation,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    info!(transfers = plan.len(), shards = simulation.config().shard_count, "starting simulation");
    let report = match simulation.run(&plan) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Simulation failed: {}", e);
            process::exit(1);
        }
    };
    info!(
        local = report.statistics.local_transfers(),
        cross_shard = report.statistics.cross_shard_transfers(),
        failures = report.statistics.failures(),
        orphaned = report.orphaned_contexts,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "simulation finished"
    );

    let mut stdout = std::io::stdout();
    if let Err(e) = write_statistics(&report, &mut stdout) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
    if args.histories {
        let written = writeln!(stdout)
            .map_err(csv::Error::from)
            .and_then(|()| write_histories(&report.histories, &mut stdout));
        if let Err(e) = written {
            eprintln!("Error writing output: {}", e);
            process::exit(1);
        }
    }
}

/// Raw CSV record matching the plan format.
///
/// Fields: `source, destination, amount`
#[derive(Debug, Deserialize)]
struct PlanRecord {
    source: u16,
    destination: u16,
    amount: Decimal,
}

impl From<PlanRecord> for TransferOrder {
    fn from(record: PlanRecord) -> Self {
        TransferOrder::new(
            AccountId(record.source),
            AccountId(record.destination),
            record.amount,
        )
    }
}

/// Reads a transfer plan from CSV.
///
/// Malformed rows are skipped with a warning. Range and amount checks
/// happen later, when the plan is submitted.
///
/// # Example
///
/// ```csv
/// source,destination,amount
/// 1,2,10
/// 2,1,2.5
/// ```
///
/// # Errors
///
/// Returns a CSV error if the header cannot be read.
pub fn read_plan<R: Read>(reader: R) -> Result<Vec<TransferOrder>, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);
    rdr.headers()?;

    let mut plan = Vec::new();
    for result in rdr.deserialize::<PlanRecord>() {
        match result {
            Ok(record) => plan.push(record.into()),
            Err(e) => warn!(error = %e, "skipping malformed plan row"),
        }
    }
    Ok(plan)
}

/// Writes one row per shard.
///
/// Columns: `shard, accepted, local_transfers, cross_shard_transfers, failures`
pub fn write_statistics<W: Write>(report: &SimulationReport, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for shard in &report.statistics.shards {
        wtr.serialize(shard)?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HistoryRow {
    account: AccountId,
    time: u64,
    balance: Decimal,
    pending_in: Decimal,
}

/// Writes every history entry, account by account.
///
/// Columns: `account, time, balance, pending_in`
pub fn write_histories<W: Write>(histories: &AllHistory, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for history in histories.iter() {
        for state in history.states() {
            wtr.serialize(HistoryRow {
                account: history.account(),
                time: state.time.0,
                balance: state.balance,
                pending_in: state.pending_in,
            })?;
        }
    }
    wtr.flush()?;
    Ok(())
}
