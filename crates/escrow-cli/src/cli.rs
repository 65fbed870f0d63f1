//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand, ValueEnum};
use escrow_core::trade::{DepositScheme, TradeRole};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level (error, warn, info, debug, trace); overrides --verbose
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a complete in-process trade between maker, taker and mediator
    Simulate {
        /// The maker buys (default: the maker sells)
        #[arg(long)]
        buyer_is_maker: bool,
        /// Deposit scheme of the offer
        #[arg(long, value_enum, default_value_t = SchemeArg::Classic)]
        scheme: SchemeArg,
        /// Buyer opens mediation after starting the payment
        #[arg(long)]
        dispute: bool,
        /// Mediator is offline when the dispute is opened
        #[arg(long, requires = "dispute")]
        offline_agent: bool,
        /// Print the report as JSON instead of a transcript
        #[arg(long)]
        json: bool,
    },
    /// Print the pipeline tables
    Tables {
        /// Only this role
        #[arg(long, value_enum)]
        role: Option<RoleArg>,
    },
    /// Print an example configuration file
    ExampleConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchemeArg {
    Classic,
    Multisig,
}

impl From<SchemeArg> for DepositScheme {
    fn from(scheme: SchemeArg) -> Self {
        match scheme {
            SchemeArg::Classic => DepositScheme::Classic,
            SchemeArg::Multisig => DepositScheme::Multisig,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoleArg {
    MakerBuyer,
    MakerSeller,
    TakerBuyer,
    TakerSeller,
}

impl From<RoleArg> for TradeRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::MakerBuyer => TradeRole::MAKER_BUYER,
            RoleArg::MakerSeller => TradeRole::MAKER_SELLER,
            RoleArg::TakerBuyer => TradeRole::TAKER_BUYER,
            RoleArg::TakerSeller => TradeRole::TAKER_SELLER,
        }
    }
}
