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
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use trustnet_payments::{
    GraphPathFinder, MemoryStorage, NodeId, PaymentConfig, PaymentOutcome, PaymentsManager,
    TransactionId, TrustLineAmount, TrustLines, codec,
};

/// Upper bound on delivery and clock rounds for one payment.
const MAX_ROUNDS: usize = 1_000_000;

/// Payment network simulator - run payments over a trust line graph
///
/// Builds one in-process node per id found in the trust line CSV, runs every
/// payment of the payments CSV to completion on a virtual clock, then prints
/// the payment outcomes followed by every node's trust lines.
#[derive(Parser, Debug)]
#[command(name = "trustnet-payments")]
#[command(about = "Simulates multi-hop payments over trust lines", long_about = None)]
struct Args {
    /// CSV file with trust lines
    ///
    /// Expected format: from,to,limit (hex node ids; `from` may pay `to` up to `limit`)
    #[arg(value_name = "TRUST_LINES")]
    trust_lines: PathBuf,

    /// CSV file with payments, processed in order
    ///
    /// Expected format: from,to,amount
    #[arg(value_name = "PAYMENTS")]
    payments: PathBuf,

    /// TOML file with protocol settings; the flags below take precedence
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Longest accepted path, sender and receiver included [default: 5]
    #[arg(long)]
    max_path_length: Option<usize>,

    /// Per-hop message transfer lag of the virtual network, in milliseconds [default: 2000]
    #[arg(long)]
    lag_ms: Option<u64>,
}

impl Args {
    /// Settings from `--config`, or the defaults, with flag overrides applied.
    fn payment_config(&self) -> Result<PaymentConfig, Box<dyn std::error::Error>> {
        let config = match &self.config {
            Some(path) => PaymentConfig::from_toml(&fs::read_to_string(path)?)?,
            None => PaymentConfig::new(),
        };
        Ok(self.apply_overrides(config))
    }

    fn apply_overrides(&self, mut config: PaymentConfig) -> PaymentConfig {
        if let Some(length) = self.max_path_length {
            config.max_path_length = length;
        }
        if let Some(lag) = self.lag_ms {
            config.message_transfer_lag = Duration::from_millis(lag);
        }
        config
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,trustnet_payments=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match args.payment_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error reading configuration: {}", e);
            process::exit(1);
        }
    };

    let lines = match open(&args.trust_lines).map(read_trust_lines) {
        Ok(Ok(lines)) => lines,
        Ok(Err(e)) | Err(e) => {
            eprintln!("Error reading '{}': {}", args.trust_lines.display(), e);
            process::exit(1);
        }
    };
    let payments = match open(&args.payments).map(read_payments) {
        Ok(Ok(payments)) => payments,
        Ok(Err(e)) | Err(e) => {
            eprintln!("Error reading '{}': {}", args.payments.display(), e);
            process::exit(1);
        }
    };

    let mut simulation = Simulation::new(&lines, &payments, config);
    let outcomes: Vec<OutcomeRecord> = payments
        .iter()
        .map(|payment| simulation.run_payment(payment))
        .collect();

    let mut stdout = std::io::stdout().lock();
    let written = write_outcomes(&outcomes, &mut stdout)
        .and_then(|()| writeln!(stdout).map_err(csv::Error::from))
        .and_then(|()| write_trust_lines(&simulation, &mut stdout));
    if let Err(e) = written {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

fn open(path: &PathBuf) -> Result<BufReader<File>, csv::Error> {
    Ok(BufReader::new(File::open(path)?))
}

/// Raw trust line row. Fields: `from, to, limit`
#[derive(Debug, Deserialize)]
struct TrustLineRow {
    from: String,
    to: String,
    limit: String,
}

/// Raw payment row. Fields: `from, to, amount`
#[derive(Debug, Deserialize)]
struct PaymentRow {
    from: String,
    to: String,
    amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustLineSpec {
    pub from: NodeId,
    pub to: NodeId,
    pub limit: TrustLineAmount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSpec {
    pub from: NodeId,
    pub to: NodeId,
    pub amount: TrustLineAmount,
}

fn parse_row(from: &str, to: &str, amount: &str) -> Option<(NodeId, NodeId, TrustLineAmount)> {
    Some((
        NodeId::from_str(from).ok()?,
        NodeId::from_str(to).ok()?,
        TrustLineAmount::from_str(amount).ok()?,
    ))
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .trim(Trim::All)
        .has_headers(true)
        .from_reader(reader)
}

/// Reads `from,to,limit` rows. Malformed rows are skipped with a warning.
///
/// # Errors
///
/// Returns a CSV error if the reader fails.
pub fn read_trust_lines<R: Read>(reader: R) -> Result<Vec<TrustLineSpec>, csv::Error> {
    let mut lines = Vec::new();
    for (row, result) in csv_reader(reader).deserialize::<TrustLineRow>().enumerate() {
        let parsed = result
            .ok()
            .and_then(|r| parse_row(&r.from, &r.to, &r.limit))
            .filter(|(from, to, _)| from != to && !from.is_empty() && !to.is_empty());
        match parsed {
            Some((from, to, limit)) => lines.push(TrustLineSpec { from, to, limit }),
            None => warn!(row = row + 1, "skipping malformed trust line"),
        }
    }
    Ok(lines)
}

/// Reads `from,to,amount` rows. Malformed rows are skipped with a warning.
///
/// # Errors
///
/// Returns a CSV error if the reader fails.
pub fn read_payments<R: Read>(reader: R) -> Result<Vec<PaymentSpec>, csv::Error> {
    let mut payments = Vec::new();
    for (row, result) in csv_reader(reader).deserialize::<PaymentRow>().enumerate() {
        let parsed = result
            .ok()
            .and_then(|r| parse_row(&r.from, &r.to, &r.amount))
            .filter(|(from, to, _)| !from.is_empty() && !to.is_empty());
        match parsed {
            Some((from, to, amount)) => payments.push(PaymentSpec { from, to, amount }),
            None => warn!(row = row + 1, "skipping malformed payment"),
        }
    }
    Ok(payments)
}

/// Result row of one payment.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct OutcomeRecord {
    pub from: NodeId,
    pub to: NodeId,
    pub amount: String,
    pub code: u16,
    pub outcome: String,
}

/// Every node of the network, in one process, on a virtual clock.
pub struct Simulation {
    nodes: BTreeMap<NodeId, PaymentsManager>,
    finder: Arc<GraphPathFinder>,
    origins: HashMap<TransactionId, NodeId>,
    queue: VecDeque<(NodeId, Vec<u8>)>,
    now: Duration,
}

impl Simulation {
    pub fn new(lines: &[TrustLineSpec], payments: &[PaymentSpec], config: PaymentConfig) -> Self {
        let finder = Arc::new(GraphPathFinder::new(config.max_path_length));
        let mut limits: BTreeMap<(NodeId, NodeId), TrustLineAmount> = BTreeMap::new();
        for line in lines {
            *limits.entry((line.from, line.to)).or_default() += &line.limit;
        }

        let ids: BTreeSet<NodeId> = lines
            .iter()
            .flat_map(|l| [l.from, l.to])
            .chain(payments.iter().flat_map(|p| [p.from, p.to]))
            .collect();
        let ledgers: BTreeMap<NodeId, TrustLines> =
            ids.iter().map(|id| (*id, TrustLines::new(*id))).collect();
        for &(from, to) in limits.keys() {
            let outgoing = limits.get(&(from, to)).cloned().unwrap_or_default();
            let incoming = limits.get(&(to, from)).cloned().unwrap_or_default();
            if let Some(ledger) = ledgers.get(&from) {
                ledger.open(to, incoming.clone(), outgoing.clone());
            }
            if let Some(ledger) = ledgers.get(&to) {
                ledger.open(from, outgoing, incoming);
            }
        }
        for ((from, to), limit) in &limits {
            finder.set_capacity(*from, *to, limit.clone());
        }

        let nodes = ledgers
            .into_iter()
            .map(|(id, ledger)| {
                let manager = PaymentsManager::new(
                    Arc::new(ledger),
                    Arc::new(MemoryStorage::new()),
                    finder.clone(),
                    config.clone(),
                );
                (id, manager)
            })
            .collect();
        info!(nodes = ids.len(), lines = limits.len(), "network built");

        Self {
            nodes,
            finder,
            origins: HashMap::new(),
            queue: VecDeque::new(),
            now: Duration::ZERO,
        }
    }

    /// Runs one payment until every node is idle.
    pub fn run_payment(&mut self, payment: &PaymentSpec) -> OutcomeRecord {
        let outcome = self.pay(payment);
        OutcomeRecord {
            from: payment.from,
            to: payment.to,
            amount: payment.amount.to_string(),
            code: outcome.code(),
            outcome: outcome.to_string(),
        }
    }

    fn pay(&mut self, payment: &PaymentSpec) -> PaymentOutcome {
        let Some(manager) = self.nodes.get(&payment.from) else {
            return PaymentOutcome::ProtocolError;
        };
        let id = match manager.launch_payment(payment.to, payment.amount.clone()) {
            Ok(id) => id,
            Err(error) => {
                warn!(%error, "payment not launched");
                return PaymentOutcome::UnexpectedError;
            }
        };
        self.origins.insert(id, payment.from);
        self.run_until_idle();
        self.nodes
            .get(&payment.from)
            .and_then(|manager| manager.outcome(&id))
            .unwrap_or(PaymentOutcome::UnexpectedError)
    }

    fn collect(&mut self) -> bool {
        let mut produced = false;
        for (id, resource) in self.finder.drain_resources() {
            if let Some(manager) = self.origins.get(&id).and_then(|origin| self.nodes.get(origin)) {
                manager.attach_resource(&id, resource);
                produced = true;
            }
        }
        for manager in self.nodes.values() {
            for (to, message) in manager.drain_outgoing() {
                match codec::encode(&message) {
                    Ok(bytes) => self.queue.push_back((to, bytes)),
                    Err(error) => warn!(%to, %error, "can't encode message"),
                }
                produced = true;
            }
            for request in manager.drain_subsidiary() {
                debug!(node = %manager.node(), ?request, "subsidiary request");
            }
        }
        produced
    }

    fn deliver(&mut self) {
        loop {
            self.collect();
            let Some((to, bytes)) = self.queue.pop_front() else {
                if self.collect() {
                    continue;
                }
                return;
            };
            match self.nodes.get(&to) {
                Some(manager) => {
                    if let Err(error) = manager.process_encoded(&bytes) {
                        warn!(node = %to, %error, "message dropped");
                    }
                }
                None => debug!(node = %to, "message to unknown node dropped"),
            }
        }
    }

    fn run_until_idle(&mut self) {
        for _ in 0..MAX_ROUNDS {
            self.deliver();
            let Some(deadline) = self.nodes.values().filter_map(|m| m.next_deadline()).min() else {
                return;
            };
            self.now = self.now.max(deadline);
            for manager in self.nodes.values() {
                manager.tick(self.now);
            }
        }
        warn!("simulation didn't settle");
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PaymentsManager> {
        self.nodes.values()
    }
}

/// Writes one row per payment.
///
/// Columns: `from, to, amount, code, outcome`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_outcomes<W: Write>(outcomes: &[OutcomeRecord], writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for outcome in outcomes {
        wtr.serialize(outcome)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes every trust line of every node, ordered by node then contractor.
///
/// Columns: `node, contractor, incoming_limit, outgoing_limit, balance, active`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_trust_lines<W: Write>(simulation: &Simulation, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for manager in simulation.nodes() {
        let trust_lines = manager.trust_lines();
        for contractor in trust_lines.contractors() {
            if let Some(line) = trust_lines.get(&contractor) {
                wtr.serialize(&*line)?;
            }
        }
    }
    wtr.flush()?;
    Ok(())
}
