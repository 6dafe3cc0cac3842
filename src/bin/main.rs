// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 The escrow-ledger developers
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
use escrow_ledger::{
    Actor, Currency, DealId, DisputeWinner, EngineConfig, LedgerEngine, MockProcessor, OwnerId,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Escrow Ledger - Replay marketplace operation CSV files
///
/// Reads operations from a CSV file, replays them against an in-memory
/// ledger with a mock payment processor, and outputs account balances
/// to stdout. Supports deposits, deals (open/fund/release), spends,
/// refunds, and dispute arbitration.
#[derive(Parser, Debug)]
#[command(name = "escrow-ledger")]
#[command(about = "Replays marketplace operations through the escrow ledger", long_about = None)]
struct Args {
    /// Path to CSV file with operations
    ///
    /// Expected format: op,owner,counterparty,amount,reference
    /// Example: cargo run -- operations.csv > accounts.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Currency tag for every account in the replay
    #[arg(long, default_value = "usd")]
    currency: String,

    /// Platform fee on release, in whole percent
    #[arg(long, default_value_t = 10)]
    fee_percent: u8,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let config = EngineConfig {
        fee_percent: args.fee_percent,
        currency: Currency::new(args.currency),
        ..EngineConfig::default()
    };
    let replay = match replay_operations(BufReader::new(file), config) {
        Ok(replay) => replay,
        Err(e) => {
            eprintln!("Error processing operations: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = write_accounts(&replay.engine, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `op, owner, counterparty, amount, reference`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    #[serde(deserialize_with = "csv::invalid_option", default)]
    owner: Option<u64>,
    #[serde(default)]
    counterparty: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option", default)]
    amount: Option<i64>,
    #[serde(default)]
    reference: Option<String>,
}

/// One replayable marketplace operation.
#[derive(Debug, Clone)]
enum Operation {
    /// Stage a deposit and settle it immediately via the mock processor.
    Deposit { owner: OwnerId, amount: i64, tag: String },
    OpenDeal { buyer: OwnerId, seller: OwnerId, amount: i64, tag: String },
    Fund { actor: OwnerId, tag: String },
    Release { actor: OwnerId, tag: String },
    Spend { owner: OwnerId, amount: i64, tag: String },
    Refund { amount: Option<i64>, tag: String },
    Dispute { actor: OwnerId, tag: String },
    /// Admin arbitration; `winner` is `buyer` or `seller`.
    Resolve { winner: DisputeWinner, tag: String },
}

impl CsvRecord {
    /// Converts a CSV record to an operation.
    ///
    /// Returns `None` for unknown ops or missing required fields.
    fn into_operation(self) -> Option<Operation> {
        let tag = self.reference.filter(|r| !r.is_empty())?;
        match self.op.to_lowercase().as_str() {
            "deposit" => Some(Operation::Deposit {
                owner: OwnerId(self.owner?),
                amount: self.amount?,
                tag,
            }),
            "open" => Some(Operation::OpenDeal {
                buyer: OwnerId(self.owner?),
                seller: OwnerId(self.counterparty?.trim().parse().ok()?),
                amount: self.amount?,
                tag,
            }),
            "fund" => Some(Operation::Fund {
                actor: OwnerId(self.owner?),
                tag,
            }),
            "release" => Some(Operation::Release {
                actor: OwnerId(self.owner?),
                tag,
            }),
            "spend" => Some(Operation::Spend {
                owner: OwnerId(self.owner?),
                amount: self.amount?,
                tag,
            }),
            "refund" => Some(Operation::Refund {
                amount: self.amount,
                tag,
            }),
            "dispute" => Some(Operation::Dispute {
                actor: OwnerId(self.owner?),
                tag,
            }),
            "resolve" => {
                let winner = match self.counterparty?.trim().to_lowercase().as_str() {
                    "buyer" => DisputeWinner::Buyer,
                    "seller" => DisputeWinner::Seller,
                    _ => return None,
                };
                Some(Operation::Resolve { winner, tag })
            }
            _ => None,
        }
    }
}

/// Engine plus the tag registries a replay needs: CSV rows name deals,
/// deposits, and disputes by a free-form reference tag, which maps to
/// the ids the engine allocated.
pub struct Replay {
    pub engine: LedgerEngine,
    processor: Arc<MockProcessor>,
    currency: Currency,
    deals: HashMap<String, DealId>,
    deposits: HashMap<String, String>,
}

impl Replay {
    fn new(config: EngineConfig) -> Self {
        let processor = Arc::new(MockProcessor::new());
        let currency = config.currency.clone();
        Self {
            engine: LedgerEngine::new(config, processor.clone()),
            processor,
            currency,
            deals: HashMap::new(),
            deposits: HashMap::new(),
        }
    }

    fn apply(&mut self, op: Operation) -> Result<(), escrow_ledger::LedgerError> {
        match op {
            Operation::Deposit { owner, amount, tag } => {
                let request = self.engine.deposit_request(owner, amount, &self.currency)?;
                // No live processor in a replay; settle the charge inline.
                self.processor.settle_intent(&request.payment_ref);
                self.engine.deposit_succeeded(&request.payment_ref)?;
                self.deposits.insert(tag, request.payment_ref);
                Ok(())
            }
            Operation::OpenDeal { buyer, seller, amount, tag } => {
                let deal = self.engine.open_deal(buyer, seller, amount, &self.currency)?;
                self.deals.insert(tag, deal);
                Ok(())
            }
            Operation::Fund { actor, tag } => {
                let deal = self.deal(&tag)?;
                self.engine.fund_deal(deal, Actor::User(actor))?;
                Ok(())
            }
            Operation::Release { actor, tag } => {
                let deal = self.deal(&tag)?;
                self.engine.release(deal, Actor::User(actor))?;
                Ok(())
            }
            Operation::Spend { owner, amount, tag } => {
                self.engine.spend(
                    owner,
                    amount,
                    &self.currency,
                    escrow_ledger::EntryRef::Spend,
                    &tag,
                )?;
                Ok(())
            }
            Operation::Refund { amount, tag } => {
                let payment_ref = self
                    .deposits
                    .get(&tag)
                    .cloned()
                    .ok_or(escrow_ledger::LedgerError::UnknownPaymentReference)?;
                self.engine.refund(&payment_ref, amount)?;
                Ok(())
            }
            Operation::Dispute { actor, tag } => {
                let deal = self.deal(&tag)?;
                self.engine.open_dispute(deal, Actor::User(actor))?;
                Ok(())
            }
            Operation::Resolve { winner, tag } => {
                let deal = self.deal(&tag)?;
                let dispute = self
                    .engine
                    .dispute_for_deal(deal)
                    .ok_or(escrow_ledger::LedgerError::DisputeNotFound)?;
                self.engine.resolve_dispute(dispute, winner, Actor::Admin)?;
                Ok(())
            }
        }
    }

    fn deal(&self, tag: &str) -> Result<DealId, escrow_ledger::LedgerError> {
        self.deals
            .get(tag)
            .copied()
            .ok_or(escrow_ledger::LedgerError::DealNotFound)
    }
}

/// Replays operations from a CSV reader.
///
/// Streaming parse; malformed rows and failed operations are skipped,
/// logged in debug builds, and never stop the replay.
///
/// # CSV Format
///
/// Expected columns: `op, owner, counterparty, amount, reference`
/// - `op`: deposit, open, fund, release, spend, refund, dispute, resolve
/// - `owner`: acting user id (blank for refund/resolve)
/// - `counterparty`: seller id for `open`; `buyer`/`seller` for `resolve`
/// - `amount`: minor units (blank where the op takes none)
/// - `reference`: tag naming the deposit or deal the row targets
///
/// # Example
///
/// ```csv
/// op,owner,counterparty,amount,reference
/// deposit,1,,10000,d1
/// open,1,2,10000,deal-1
/// fund,1,,,deal-1
/// release,1,,,deal-1
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the CSV structure is
/// invalid. Individual operation errors do not stop processing.
pub fn replay_operations<R: Read>(reader: R, config: EngineConfig) -> Result<Replay, csv::Error> {
    let mut replay = Replay::new(config);

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for result in rdr.deserialize::<CsvRecord>() {
        match result {
            Ok(record) => {
                let Some(op) = record.into_operation() else {
                    #[cfg(debug_assertions)]
                    eprintln!("Skipping invalid operation record");
                    continue;
                };

                if let Err(_e) = replay.apply(op) {
                    #[cfg(debug_assertions)]
                    eprintln!("Skipping operation: {}", _e);
                }
            }
            Err(_e) => {
                #[cfg(debug_assertions)]
                eprintln!("Skipping malformed row: {}", _e);
                continue;
            }
        }
    }

    Ok(replay)
}

/// Writes account balances to a CSV writer.
///
/// # CSV Format
///
/// Columns: `account, owner, kind, currency, balance`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_accounts<W: Write>(engine: &LedgerEngine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    for account in engine.store().accounts() {
        wtr.serialize(&*account)?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn replay(csv: &str) -> Replay {
        replay_operations(Cursor::new(csv), EngineConfig::default()).unwrap()
    }

    fn usd() -> Currency {
        Currency::new("usd")
    }

    #[test]
    fn parse_simple_deposit() {
        let replay = replay("op,owner,counterparty,amount,reference\ndeposit,1,,10000,d1\n");
        assert_eq!(replay.engine.available_balance(OwnerId(1), &usd()), 10_000);
    }

    #[test]
    fn parse_full_deal_lifecycle() {
        let replay = replay(
            "op,owner,counterparty,amount,reference\n\
             deposit,1,,10000,d1\n\
             open,1,2,10000,deal-1\n\
             fund,1,,,deal-1\n\
             release,1,,,deal-1\n",
        );
        assert_eq!(replay.engine.available_balance(OwnerId(1), &usd()), 0);
        assert_eq!(replay.engine.available_balance(OwnerId(2), &usd()), 9_000);
        assert_eq!(replay.engine.platform_revenue_balance(&usd()), 1_000);
    }

    #[test]
    fn parse_dispute_resolved_for_buyer() {
        let replay = replay(
            "op,owner,counterparty,amount,reference\n\
             deposit,1,,5000,d1\n\
             open,1,2,5000,deal-1\n\
             fund,1,,,deal-1\n\
             dispute,1,,,deal-1\n\
             resolve,,buyer,,deal-1\n",
        );
        assert_eq!(replay.engine.available_balance(OwnerId(1), &usd()), 5_000);
        assert_eq!(replay.engine.escrow_balance(OwnerId(1), &usd()), 0);
    }

    #[test]
    fn parse_spend_and_refund() {
        let replay = replay(
            "op,owner,counterparty,amount,reference\n\
             deposit,1,,10000,d1\n\
             spend,1,,2000,boost-7\n\
             refund,,,3000,d1\n",
        );
        assert_eq!(replay.engine.available_balance(OwnerId(1), &usd()), 5_000);
        assert_eq!(replay.engine.platform_revenue_balance(&usd()), 2_000);
    }

    #[test]
    fn parse_with_whitespace() {
        let replay = replay("op,owner,counterparty,amount,reference\n deposit , 1 , , 100 , d1 \n");
        assert_eq!(replay.engine.available_balance(OwnerId(1), &usd()), 100);
    }

    #[test]
    fn skip_malformed_rows() {
        let replay = replay(
            "op,owner,counterparty,amount,reference\n\
             deposit,1,,100,d1\n\
             teleport,9,,42,x\n\
             deposit,not-a-number,,100,d2\n\
             deposit,2,,200,d3\n",
        );
        assert_eq!(replay.engine.available_balance(OwnerId(1), &usd()), 100);
        assert_eq!(replay.engine.available_balance(OwnerId(2), &usd()), 200);
    }

    #[test]
    fn failed_operation_does_not_stop_replay() {
        // Release of an unfunded deal fails; the later deposit still lands.
        let replay = replay(
            "op,owner,counterparty,amount,reference\n\
             open,1,2,5000,deal-1\n\
             release,1,,,deal-1\n\
             deposit,1,,700,d1\n",
        );
        assert_eq!(replay.engine.available_balance(OwnerId(1), &usd()), 700);
        assert_eq!(replay.engine.available_balance(OwnerId(2), &usd()), 0);
    }

    #[test]
    fn write_accounts_to_csv() {
        let replay = replay("op,owner,counterparty,amount,reference\ndeposit,1,,10000,d1\n");

        let mut output = Vec::new();
        write_accounts(&replay.engine, &mut output).unwrap();

        let output_str = String::from_utf8(output).unwrap();
        assert!(output_str.contains("account,owner,kind,currency,balance"));
        assert!(output_str.contains("available"));
        assert!(output_str.contains("clearing"));
    }
}
