//! Command handlers for the escrow CLI

use escrow_core::trade::{Direction, TradeRole};
use escrow_runtime::Protocol;
use tracing::info;

use crate::cli::{Cli, Commands, RoleArg};
use crate::config::CliAppConfig;
use crate::error::Result;
use crate::simulation::{Simulation, SimulationOptions, SimulationReport};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: CliAppConfig) -> Result<()> {
        match cli.command {
            Commands::Simulate {
                buyer_is_maker,
                scheme,
                dispute,
                offline_agent,
                json,
            } => {
                let options = SimulationOptions {
                    maker_direction: if buyer_is_maker {
                        Direction::Buyer
                    } else {
                        Direction::Seller
                    },
                    scheme: scheme.into(),
                    dispute,
                    offline_agent,
                };
                Self::handle_simulate_command(config, options, json).await
            }
            Commands::Tables { role } => {
                print!("{}", Self::render_tables(role));
                Ok(())
            }
            Commands::ExampleConfig => {
                print!("{}", CliAppConfig::default().to_toml()?);
                Ok(())
            }
        }
    }

    async fn handle_simulate_command(
        config: CliAppConfig,
        options: SimulationOptions,
        json: bool,
    ) -> Result<()> {
        info!(?options, "Starting simulation");
        let report = Simulation::start(config, options).await?.run().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print!("{}", Self::render_report(&report));
        }
        Ok(())
    }

    /// Pipeline listing of one role, or of all four
    pub fn render_tables(role: Option<RoleArg>) -> String {
        let roles: Vec<TradeRole> = match role {
            Some(role) => vec![role.into()],
            None => TradeRole::ALL.to_vec(),
        };
        roles
            .into_iter()
            .map(|role| Protocol::for_role(role).describe())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn render_report(report: &SimulationReport) -> String {
        let mut out = format!(
            "Trade {} ({} deposit, {})\n\n",
            report.trade_id, report.scheme, report.maker_role
        );
        for line in &report.transcript {
            out.push_str(&format!(
                "[{:>6} ms] {:<8} {}\n",
                line.at_ms, line.node, line.event
            ));
        }
        let ledger = &report.ledger;
        let network = &report.network;
        out.push_str(&format!(
            "\nOutcome: {}\nLedger: height {}, taker fee {}, deposit {}, payout {}, multisig funding {}\n",
            report.outcome,
            ledger.height,
            ledger.taker_fee,
            ledger.deposit,
            ledger.payout,
            ledger.multisig_funding
        ));
        out.push_str(&format!(
            "Network: {} delivered, {} stored in mailbox, {} faults, {} statistics published\n",
            network.delivered, network.stored_in_mailbox, network.faults, network.statistics_published
        ));
        out
    }
}
