use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::application::{AccountRepository, ErrorClass, LedgerError, TransactionLedger};
use crate::config::{DEFAULT_MAX_CONNECTIONS, LedgerConfig};
use crate::domain::{AccountId, format_cents, parse_cents};
use crate::storage::SqliteStore;

/// Coffer - account balances over an atomic movement ledger
#[derive(Parser)]
#[command(name = "coffer")]
#[command(about = "Open accounts, move money in and out, and audit the ledger")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, env = "COFFER_DATABASE", default_value = "coffer.db")]
    pub database: String,

    /// Maximum pooled database connections
    #[arg(long, env = "COFFER_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: u32,

    /// Milliseconds to wait on the database write lock
    #[arg(long, env = "COFFER_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    pub busy_timeout_ms: u64,

    /// Deadline for a single movement, in milliseconds
    #[arg(long, env = "COFFER_DEADLINE_MS", default_value_t = 5000)]
    pub deadline_ms: u64,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Open a new account
    Open {
        /// Opening balance (e.g., "50.00"), defaults to zero
        #[arg(long)]
        initial: Option<String>,
    },

    /// Show an account's balance and status
    Balance {
        /// Account ID
        id: i64,
    },

    /// Deposit money into an account
    Deposit {
        /// Account ID
        id: i64,

        /// Amount to deposit (e.g., "50.00" or "50")
        amount: String,
    },

    /// Withdraw money from an account
    Withdraw {
        /// Account ID
        id: i64,

        /// Amount to withdraw (e.g., "50.00" or "50")
        amount: String,
    },

    /// Close an account; closed accounts accept no movements
    Close {
        /// Account ID
        id: i64,
    },

    /// List an account's movements, newest first
    History {
        /// Account ID
        id: i64,

        /// Maximum number of movements to show
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Number of movements to skip
        #[arg(long, default_value = "0")]
        offset: u32,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Replay an account's ledger and compare it with the stored balance
    Verify {
        /// Account ID
        id: i64,
    },
}

impl Cli {
    pub fn config(&self) -> LedgerConfig {
        LedgerConfig::for_path(&self.database)
            .with_max_connections(self.max_connections)
            .with_busy_timeout(Duration::from_millis(self.busy_timeout_ms))
            .with_unit_deadline(Duration::from_millis(self.deadline_ms))
    }

    /// Run the command and map the outcome to a process exit code.
    pub async fn run(self) -> ExitCode {
        match self.dispatch().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e:#}");
                ExitCode::from(exit_code_for(&e))
            }
        }
    }

    async fn dispatch(self) -> Result<()> {
        let config = self.config();

        match self.command {
            Commands::Init => {
                SqliteStore::init(&config).await?;
                println!("Database initialized: {}", self.database);
            }

            Commands::Open { initial } => {
                let initial = initial
                    .map(|amount| parse_cents(&amount))
                    .transpose()
                    .map_err(|e| LedgerError::InvalidArgument(format!("initial balance: {e}")))?;

                let services = Services::connect(&config).await?;
                let id = services.accounts.create_account(initial).await?;
                println!("Opened account {} ({})", id, format_cents(initial.unwrap_or(0)));
            }

            Commands::Balance { id } => {
                let services = Services::connect(&config).await?;
                let snapshot = services.accounts.get_balance(AccountId(id)).await?;
                println!(
                    "Account {}: {} ({})",
                    snapshot.account_id,
                    format_cents(snapshot.balance),
                    snapshot.status
                );
            }

            Commands::Deposit { id, amount } => {
                let amount = parse_amount(&amount)?;
                let services = Services::connect(&config).await?;
                let receipt = services.ledger.deposit(AccountId(id), amount).await?;
                println!(
                    "Deposited {} into account {} (transaction {}); balance {}",
                    format_cents(amount),
                    id,
                    receipt.transaction_id,
                    format_cents(receipt.new_balance)
                );
            }

            Commands::Withdraw { id, amount } => {
                let amount = parse_amount(&amount)?;
                let services = Services::connect(&config).await?;
                let receipt = services.ledger.withdraw(AccountId(id), amount).await?;
                println!(
                    "Withdrew {} from account {} (transaction {}); balance {}",
                    format_cents(amount),
                    id,
                    receipt.transaction_id,
                    format_cents(receipt.new_balance)
                );
            }

            Commands::Close { id } => {
                let services = Services::connect(&config).await?;
                let account = services.accounts.close_account(AccountId(id)).await?;
                println!(
                    "Closed account {} with balance {}",
                    account.id,
                    format_cents(account.balance)
                );
            }

            Commands::History {
                id,
                limit,
                offset,
                json,
            } => {
                let services = Services::connect(&config).await?;
                let transactions = services
                    .ledger
                    .list_transactions(AccountId(id), limit, offset)
                    .await?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&transactions)?);
                } else if transactions.is_empty() {
                    println!("No transactions found.");
                } else {
                    println!(
                        "{:<8} {:<12} {:>14} {:>14}  {}",
                        "ID", "TYPE", "AMOUNT", "BALANCE", "TIMESTAMP"
                    );
                    println!("{}", "-".repeat(80));
                    for tx in &transactions {
                        println!(
                            "{:<8} {:<12} {:>14} {:>14}  {}",
                            tx.id,
                            tx.kind,
                            format_cents(tx.amount),
                            format_cents(tx.resulting_balance),
                            tx.timestamp.format("%Y-%m-%d %H:%M:%S%.6f")
                        );
                    }
                }
            }

            Commands::Verify { id } => {
                let services = Services::connect(&config).await?;
                let report = services.ledger.verify_account(AccountId(id)).await?;

                println!("Account {}", report.account_id);
                println!("  Opening balance:  {}", format_cents(report.initial_balance));
                println!("  Entries:          {}", report.entry_count);
                println!("  Replayed balance: {}", format_cents(report.replayed_balance));
                println!("  Recorded balance: {}", format_cents(report.recorded_balance));
                if let Some(entry) = report.first_broken_entry {
                    println!("  First broken entry: {}", entry);
                }
                println!();

                if !report.is_consistent() {
                    anyhow::bail!("ledger for account {} is inconsistent", report.account_id);
                }
                println!("Ledger is consistent.");
            }
        }

        Ok(())
    }
}

/// The repository and ledger, sharing one store.
struct Services {
    accounts: AccountRepository<SqliteStore>,
    ledger: TransactionLedger<SqliteStore>,
}

impl Services {
    async fn connect(config: &LedgerConfig) -> Result<Self> {
        let store = SqliteStore::connect(config).await.with_context(|| {
            format!(
                "Cannot open database '{}'. Run `coffer init` first",
                config.database_url
            )
        })?;
        let store = Arc::new(store);

        Ok(Self {
            accounts: AccountRepository::new(Arc::clone(&store)),
            ledger: TransactionLedger::new(store).with_deadline(config.unit_deadline),
        })
    }
}

fn parse_amount(input: &str) -> Result<i64, LedgerError> {
    parse_cents(input)
        .map_err(|e| LedgerError::InvalidArgument(format!("amount '{}': {}", input.trim(), e)))
}

/// Exit code per failure class; anything that is not a ledger error is a
/// plain failure.
fn exit_code_for(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<LedgerError>().map(LedgerError::class) {
        Some(ErrorClass::BadRequest) => 2,
        Some(ErrorClass::NotFound) => 3,
        Some(ErrorClass::Forbidden) => 4,
        Some(ErrorClass::ServerError) => 5,
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_movement() {
        let cli = Cli::try_parse_from(["coffer", "-d", "test.db", "withdraw", "7", "12.50"]).unwrap();
        assert_eq!(cli.database, "test.db");
        assert!(matches!(
            cli.command,
            Commands::Withdraw { id: 7, ref amount } if amount == "12.50"
        ));
    }

    #[test]
    fn test_config_from_flags() {
        let cli = Cli::try_parse_from([
            "coffer",
            "--deadline-ms",
            "250",
            "--max-connections",
            "2",
            "balance",
            "1",
        ])
        .unwrap();
        let config = cli.config();
        assert_eq!(config.unit_deadline, Duration::from_millis(250));
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.database_url, "sqlite:coffer.db");
    }

    #[test]
    fn test_parse_amount_is_invalid_argument() {
        let err = parse_amount("12.345").unwrap_err();
        assert_eq!(err.class(), ErrorClass::BadRequest);
    }

    #[test]
    fn test_exit_codes_follow_error_class() {
        let not_found = anyhow::Error::from(LedgerError::AccountNotFound(AccountId(9)));
        assert_eq!(exit_code_for(&not_found), 3);

        let insufficient = anyhow::Error::from(LedgerError::InsufficientFunds {
            account_id: AccountId(9),
            balance: 0,
            required: 100,
        });
        assert_eq!(exit_code_for(&insufficient), 2);

        let other = anyhow::anyhow!("unrelated");
        assert_eq!(exit_code_for(&other), 1);
    }
}
