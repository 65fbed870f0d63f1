//! Per-role protocol
//!
//! One [`Protocol`] value per [`TradeRole`]. It maps an inbound message or a
//! user action to the transition to run, using the pipeline tables in
//! [`tables`]. Admission of the chosen transition is left to the
//! [`ConditionMatcher`].

pub mod condition;
pub mod tables;

pub use condition::{Admission, ConditionFailure, ConditionMatcher};
pub use tables::{FollowUp, Transition};

use std::fmt::{self, Write as _};
use std::time::Duration;

use escrow_core::message::TradeMessage;
use escrow_core::trade::{DepositScheme, Phase, Trade, TradeRole};

use tables::*;

/// Actions the local user triggers on a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserAction {
    TakeOffer,
    PaymentStarted,
    PaymentReceived,
    CompleteTrade,
}

impl fmt::Display for UserAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Routing decision for a message or action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Run(&'static Transition),
    /// Consumed without running anything
    Ignore(String),
    /// Refused in the current protocol state
    Reject(String),
    /// No transition of this role answers the trigger
    Unhandled,
}

impl Transition {
    /// Timeout of a run, `None` when timeouts are not enforced
    pub fn timeout(&self, enforce: bool) -> Option<Duration> {
        self.timeout_secs
            .filter(|_| enforce)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    role: TradeRole,
}

impl Protocol {
    pub fn for_role(role: TradeRole) -> Self {
        Self { role }
    }

    pub fn role(&self) -> TradeRole {
        self.role
    }

    pub fn counterpart(&self) -> TradeRole {
        self.role.counterpart()
    }

    /// Every transition of this role, across both deposit schemes
    pub fn transitions(&self) -> &'static [&'static Transition] {
        match (self.role.is_maker(), self.role.is_buyer()) {
            (true, true) => MAKER_BUYER,
            (true, false) => MAKER_SELLER,
            (false, true) => TAKER_BUYER,
            (false, false) => TAKER_SELLER,
        }
    }

    pub fn route(&self, trade: &Trade, message: &TradeMessage) -> Dispatch {
        let maker = self.role.is_maker();
        let buyer = self.role.is_buyer();
        let classic = trade.offer.deposit_scheme == DepositScheme::Classic;

        match message {
            TradeMessage::InputsForDepositTxRequest(_) => run_if(maker && classic, &MAKER_INPUTS_REQUEST),
            TradeMessage::InputsForDepositTxResponse(_) => match (maker, buyer) {
                (false, true) if classic => Dispatch::Run(&TAKER_BUYER_INPUTS_RESPONSE),
                (false, false) if classic => Dispatch::Run(&TAKER_SELLER_INPUTS_RESPONSE),
                _ => Dispatch::Unhandled,
            },
            TradeMessage::DepositTxMessage(_) => {
                run_if(maker && !buyer && classic, &SELLER_AS_MAKER_DEPOSIT_TX)
            }
            TradeMessage::DelayedPayoutTxSignatureRequest(_) => {
                run_if(buyer && classic, &BUYER_SIGNATURE_REQUEST)
            }
            TradeMessage::DelayedPayoutTxSignatureResponse(_) => {
                run_if(!buyer && classic, &SELLER_SIGNATURE_RESPONSE)
            }
            TradeMessage::DepositTxAndDelayedPayoutTxMessage(_) => {
                run_if(buyer && classic, &BUYER_DEPOSIT_PUBLISHED)
            }
            TradeMessage::CounterCurrencyTransferStartedMessage(_) => {
                run_if(!buyer, &SELLER_TRANSFER_STARTED)
            }
            TradeMessage::PayoutTxPublishedMessage(_) => run_if(buyer, &BUYER_PAYOUT_PUBLISHED),
            TradeMessage::MakerReadyToFundMultisigRequest(_) => {
                run_if(maker && !classic, &MAKER_READY_TO_FUND_REQUEST)
            }
            TradeMessage::MakerReadyToFundMultisigResponse(response) => {
                if maker || classic {
                    return Dispatch::Unhandled;
                }
                let model = &trade.process_model;
                if model.multisig_deposit_initiated {
                    Dispatch::Reject("multisig deposit already initiated".to_string())
                } else if response.is_maker_ready_to_fund_multisig {
                    Dispatch::Run(&TAKER_MAKER_READY)
                } else if !model.fee_tx_initiated {
                    Dispatch::Run(&TAKER_RESERVE_TRADE)
                } else {
                    Dispatch::Ignore("maker not ready, taker fee already published".to_string())
                }
            }
            TradeMessage::InitMultisigMessage(_) => run_if(!classic, &INIT_MULTISIG),
        }
    }

    pub fn user_action(&self, trade: &Trade, action: UserAction) -> Dispatch {
        let classic = trade.offer.deposit_scheme == DepositScheme::Classic;
        let phase = trade.phase();
        match action {
            UserAction::TakeOffer if self.role.is_maker() => Dispatch::Unhandled,
            UserAction::TakeOffer if classic => Dispatch::Run(&TAKER_TAKE_OFFER),
            UserAction::TakeOffer => Dispatch::Run(&TAKER_MULTISIG_TAKE_OFFER),
            UserAction::PaymentStarted if !self.role.is_buyer() => Dispatch::Unhandled,
            UserAction::PaymentStarted if phase >= Phase::FiatSent => {
                Dispatch::Run(&BUYER_PAYMENT_STARTED_RESEND)
            }
            UserAction::PaymentStarted => Dispatch::Run(&BUYER_PAYMENT_STARTED),
            UserAction::PaymentReceived if self.role.is_buyer() => Dispatch::Unhandled,
            UserAction::PaymentReceived if phase >= Phase::PayoutPublished => {
                Dispatch::Run(&SELLER_PAYMENT_RECEIVED_RESEND)
            }
            UserAction::PaymentReceived => Dispatch::Run(&SELLER_PAYMENT_RECEIVED),
            UserAction::CompleteTrade => Dispatch::Run(&COMPLETE_TRADE),
        }
    }

    /// Timer driven poll of the maker during the multisig reservation
    pub fn periodic_request(&self, trade: &Trade) -> Dispatch {
        let multisig = trade.offer.deposit_scheme == DepositScheme::Multisig;
        if self.role.is_maker() || !multisig {
            return Dispatch::Unhandled;
        }
        if trade.process_model.multisig_deposit_initiated {
            return Dispatch::Ignore("multisig deposit already initiated".to_string());
        }
        Dispatch::Run(&TAKER_RESEND_READY_TO_FUND)
    }

    pub fn fund_multisig(&self, trade: &Trade) -> Dispatch {
        if trade.offer.deposit_scheme != DepositScheme::Multisig {
            return Dispatch::Unhandled;
        }
        let model = &trade.process_model;
        if !model.multisig_setup_complete {
            return Dispatch::Ignore("multisig setup incomplete".to_string());
        }
        if self.role.is_buyer() {
            Dispatch::Run(&BUYER_FUND_MULTISIG)
        } else {
            Dispatch::Run(&SELLER_FUND_MULTISIG)
        }
    }

    /// Work to pick up again for a trade loaded from the store
    pub fn on_resume(&self, trade: &Trade) -> FollowUp {
        let model = &trade.process_model;
        if trade.offer.deposit_scheme != DepositScheme::Multisig
            || trade.is_terminal()
            || model.multisig_deposit_initiated
        {
            return FollowUp::None;
        }
        if model.multisig_setup_complete {
            FollowUp::FundMultisigIfReady
        } else if !self.role.is_maker() && model.fee_tx_initiated && trade.taker_fee_tx_id.is_some()
        {
            FollowUp::WatchFeeTxUnlock
        } else {
            FollowUp::None
        }
    }

    /// Human readable listing of every pipeline of this role
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} (counterpart {})", self.role, self.counterpart());
        for transition in self.transitions() {
            let phases: Vec<String> = transition
                .allowed_phases
                .iter()
                .map(ToString::to_string)
                .collect();
            let _ = write!(
                out,
                "  {} on {} [{}]",
                transition.name,
                transition.on,
                phases.join(", ")
            );
            if let Some(secs) = transition.timeout_secs {
                let _ = write!(out, " timeout {}s", secs);
            }
            if transition.follow_up != FollowUp::None {
                let _ = write!(out, " then {:?}", transition.follow_up);
            }
            let _ = writeln!(out);
            for (index, task) in transition.tasks.iter().enumerate() {
                let _ = writeln!(out, "    {}. {}", index + 1, task);
            }
        }
        out
    }
}

fn run_if(admitted: bool, transition: &'static Transition) -> Dispatch {
    if admitted {
        Dispatch::Run(transition)
    } else {
        Dispatch::Unhandled
    }
}
