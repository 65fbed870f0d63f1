//! Pipeline tables
//!
//! Every transition of every role is a constant: the trigger it answers, the
//! phases it is admitted in, the ordered task tags and the timeout. Pipeline
//! order alone enforces deposit and payout sequencing: fee and witness checks
//! precede the contract, and the deposit is only published once the delayed
//! payout carries both signatures.

use escrow_core::trade::Phase;

use crate::task::TaskKind;

use TaskKind::*;

/// What the engine does after a transition completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    None,
    /// Fund the multisig once both participant infos are known
    FundMultisigIfReady,
    /// Wait for the published taker fee to unlock, then poll the maker
    WatchFeeTxUnlock,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Transition {
    pub name: &'static str,
    /// Message kind or action name the transition answers
    pub on: &'static str,
    pub allowed_phases: &'static [Phase],
    pub tasks: &'static [TaskKind],
    pub timeout_secs: Option<u64>,
    pub follow_up: FollowUp,
}

const TAKE_OFFER_TIMEOUT: Option<u64> = Some(30);
const MESSAGE_TIMEOUT: Option<u64> = Some(60);
const MULTISIG_TIMEOUT: Option<u64> = Some(30);

const INIT: &[Phase] = &[Phase::Init];
const FEE_PUBLISHED: &[Phase] = &[Phase::TakerFeePublished];
const RESERVATION: &[Phase] = &[Phase::Init, Phase::TakerFeePublished];

// ----------------------------------------------------------------------------
// Classic: take offer and deposit
// ----------------------------------------------------------------------------

pub const TAKER_TAKE_OFFER: Transition = Transition {
    name: "TakerTakeOffer",
    on: "TakeOffer",
    allowed_phases: INIT,
    tasks: &[
        ApplyFilter,
        TakerVerifyMakerFeePayment,
        TakerCreateFeeTx,
        TakerSendInputsForDepositTxRequest,
    ],
    timeout_secs: TAKE_OFFER_TIMEOUT,
    follow_up: FollowUp::None,
};

pub const MAKER_INPUTS_REQUEST: Transition = Transition {
    name: "MakerHandleInputsForDepositTxRequest",
    on: "InputsForDepositTxRequest",
    allowed_phases: INIT,
    tasks: &[
        MakerProcessesInputsForDepositTxRequest,
        ApplyFilter,
        VerifyPeersAccountAgeWitness,
        MakerVerifyTakerFeePayment,
        MakerSetsLockTime,
        MakerCreateAndSignContract,
        MakerCreatesUnsignedDepositTx,
        MakerSendsInputsForDepositTxResponse,
    ],
    timeout_secs: MESSAGE_TIMEOUT,
    follow_up: FollowUp::None,
};

pub const TAKER_BUYER_INPUTS_RESPONSE: Transition = Transition {
    name: "BuyerAsTakerHandleInputsForDepositTxResponse",
    on: "InputsForDepositTxResponse",
    allowed_phases: INIT,
    tasks: &[
        TakerProcessesInputsForDepositTxResponse,
        ApplyFilter,
        TakerVerifyAndSignContract,
        TakerPublishFeeTx,
        SignDepositTx,
        BuyerSendsDepositTxMessage,
    ],
    timeout_secs: MESSAGE_TIMEOUT,
    follow_up: FollowUp::None,
};

pub const TAKER_SELLER_INPUTS_RESPONSE: Transition = Transition {
    name: "SellerAsTakerHandleInputsForDepositTxResponse",
    on: "InputsForDepositTxResponse",
    allowed_phases: INIT,
    tasks: &[
        TakerProcessesInputsForDepositTxResponse,
        ApplyFilter,
        TakerVerifyAndSignContract,
        TakerPublishFeeTx,
        SignDepositTx,
        SellerCreatesDelayedPayoutTx,
        SellerSignsDelayedPayoutTx,
        SellerSendsDelayedPayoutTxSignatureRequest,
    ],
    timeout_secs: MESSAGE_TIMEOUT,
    follow_up: FollowUp::None,
};

pub const SELLER_AS_MAKER_DEPOSIT_TX: Transition = Transition {
    name: "SellerAsMakerHandleDepositTxMessage",
    on: "DepositTxMessage",
    allowed_phases: FEE_PUBLISHED,
    tasks: &[
        SellerAsMakerProcessDepositTxMessage,
        SignDepositTx,
        SellerCreatesDelayedPayoutTx,
        SellerSignsDelayedPayoutTx,
        SellerSendsDelayedPayoutTxSignatureRequest,
    ],
    timeout_secs: MESSAGE_TIMEOUT,
    follow_up: FollowUp::None,
};

pub const BUYER_SIGNATURE_REQUEST: Transition = Transition {
    name: "BuyerHandleDelayedPayoutTxSignatureRequest",
    on: "DelayedPayoutTxSignatureRequest",
    allowed_phases: FEE_PUBLISHED,
    tasks: &[
        BuyerProcessDelayedPayoutTxSignatureRequest,
        BuyerVerifiesPreparedDelayedPayoutTx,
        SignDepositTx,
        BuyerSignsDelayedPayoutTx,
        BuyerSendsDelayedPayoutTxSignatureResponse,
    ],
    timeout_secs: MESSAGE_TIMEOUT,
    follow_up: FollowUp::None,
};

pub const SELLER_SIGNATURE_RESPONSE: Transition = Transition {
    name: "SellerHandleDelayedPayoutTxSignatureResponse",
    on: "DelayedPayoutTxSignatureResponse",
    allowed_phases: FEE_PUBLISHED,
    tasks: &[
        SellerProcessDelayedPayoutTxSignatureResponse,
        SellerFinalizesDelayedPayoutTx,
        SellerPublishesDepositTx,
        SellerSendsDepositTxAndDelayedPayoutTxMessage,
        PublishTradeStatistics,
    ],
    timeout_secs: MESSAGE_TIMEOUT,
    follow_up: FollowUp::None,
};

pub const BUYER_DEPOSIT_PUBLISHED: Transition = Transition {
    name: "BuyerHandleDepositTxAndDelayedPayoutTxMessage",
    on: "DepositTxAndDelayedPayoutTxMessage",
    allowed_phases: FEE_PUBLISHED,
    tasks: &[
        BuyerProcessDepositTxAndDelayedPayoutTxMessage,
        BuyerVerifiesFinalDelayedPayoutTx,
    ],
    timeout_secs: MESSAGE_TIMEOUT,
    follow_up: FollowUp::None,
};

// ----------------------------------------------------------------------------
// Payment and payout
// ----------------------------------------------------------------------------

pub const BUYER_PAYMENT_STARTED: Transition = Transition {
    name: "BuyerPaymentStarted",
    on: "PaymentStarted",
    allowed_phases: &[Phase::DepositPublished],
    tasks: &[
        ApplyFilter,
        BuyerSignPayoutTx,
        BuyerSendsCounterCurrencyTransferStartedMessage,
    ],
    timeout_secs: None,
    follow_up: FollowUp::None,
};

/// Repeated action once the message went out: resend only
pub const BUYER_PAYMENT_STARTED_RESEND: Transition = Transition {
    name: "BuyerResendPaymentStarted",
    on: "PaymentStarted",
    allowed_phases: &[Phase::FiatSent],
    tasks: &[BuyerSendsCounterCurrencyTransferStartedMessage],
    timeout_secs: None,
    follow_up: FollowUp::None,
};

pub const SELLER_TRANSFER_STARTED: Transition = Transition {
    name: "SellerHandleCounterCurrencyTransferStartedMessage",
    on: "CounterCurrencyTransferStartedMessage",
    allowed_phases: &[Phase::DepositPublished, Phase::FiatSent],
    tasks: &[SellerProcessCounterCurrencyTransferStartedMessage, ApplyFilter],
    timeout_secs: MESSAGE_TIMEOUT,
    follow_up: FollowUp::None,
};

pub const SELLER_PAYMENT_RECEIVED: Transition = Transition {
    name: "SellerPaymentReceived",
    on: "PaymentReceived",
    allowed_phases: &[Phase::FiatSent, Phase::FiatReceived],
    tasks: &[
        ApplyFilter,
        SellerSignAndFinalizePayoutTx,
        SellerBroadcastPayoutTx,
        SellerSendPayoutTxPublishedMessage,
    ],
    timeout_secs: None,
    follow_up: FollowUp::None,
};

pub const SELLER_PAYMENT_RECEIVED_RESEND: Transition = Transition {
    name: "SellerResendPayoutTxPublished",
    on: "PaymentReceived",
    allowed_phases: &[Phase::PayoutPublished],
    tasks: &[SellerSendPayoutTxPublishedMessage],
    timeout_secs: None,
    follow_up: FollowUp::None,
};

pub const BUYER_PAYOUT_PUBLISHED: Transition = Transition {
    name: "BuyerHandlePayoutTxPublishedMessage",
    on: "PayoutTxPublishedMessage",
    allowed_phases: &[Phase::FiatSent, Phase::PayoutPublished],
    tasks: &[BuyerProcessPayoutTxPublishedMessage],
    timeout_secs: MESSAGE_TIMEOUT,
    follow_up: FollowUp::None,
};

pub const COMPLETE_TRADE: Transition = Transition {
    name: "CompleteTrade",
    on: "CompleteTrade",
    allowed_phases: &[Phase::PayoutPublished],
    tasks: &[CloseTrade],
    timeout_secs: None,
    follow_up: FollowUp::None,
};

// ----------------------------------------------------------------------------
// Multisig reservation and funding
// ----------------------------------------------------------------------------

pub const TAKER_MULTISIG_TAKE_OFFER: Transition = Transition {
    name: "TakerTakeMultisigOffer",
    on: "TakeOffer",
    allowed_phases: INIT,
    tasks: &[
        ApplyFilter,
        TakerVerifyMakerFeePayment,
        TakerSendReadyToFundMultisigRequest,
    ],
    timeout_secs: TAKE_OFFER_TIMEOUT,
    follow_up: FollowUp::None,
};

/// Timer driven poll of the maker once the taker fee unlocked
pub const TAKER_RESEND_READY_TO_FUND: Transition = Transition {
    name: "TakerResendReadyToFundMultisigRequest",
    on: "SendReadyToFundMultisigRequest",
    allowed_phases: RESERVATION,
    tasks: &[TakerSendReadyToFundMultisigRequest],
    timeout_secs: MULTISIG_TIMEOUT,
    follow_up: FollowUp::None,
};

pub const MAKER_READY_TO_FUND_REQUEST: Transition = Transition {
    name: "MakerHandleReadyToFundMultisigRequest",
    on: "MakerReadyToFundMultisigRequest",
    allowed_phases: RESERVATION,
    tasks: &[
        MakerProcessReadyToFundMultisigRequest,
        ApplyFilter,
        VerifyPeersAccountAgeWitness,
        MakerSetsLockTime,
        MakerCreateAndSignContract,
        MakerSendsReadyToFundMultisigResponse,
    ],
    timeout_secs: MULTISIG_TIMEOUT,
    follow_up: FollowUp::None,
};

pub const TAKER_MAKER_READY: Transition = Transition {
    name: "TakerHandleMakerReadyToFundMultisig",
    on: "MakerReadyToFundMultisigResponse",
    allowed_phases: RESERVATION,
    tasks: &[
        TakerProcessReadyToFundMultisigResponse,
        TakerVerifyMakerFeePayment,
        TakerVerifyAndSignContract,
        SendInitMultisigMessage,
    ],
    timeout_secs: MULTISIG_TIMEOUT,
    follow_up: FollowUp::None,
};

/// Maker not ready yet: reserve the trade by publishing the taker fee
pub const TAKER_RESERVE_TRADE: Transition = Transition {
    name: "TakerReserveTrade",
    on: "MakerReadyToFundMultisigResponse",
    allowed_phases: INIT,
    tasks: &[
        TakerProcessReadyToFundMultisigResponse,
        TakerCreateFeeTx,
        TakerPublishFeeTx,
    ],
    timeout_secs: MULTISIG_TIMEOUT,
    follow_up: FollowUp::WatchFeeTxUnlock,
};

pub const INIT_MULTISIG: Transition = Transition {
    name: "HandleInitMultisigMessage",
    on: "InitMultisigMessage",
    allowed_phases: RESERVATION,
    tasks: &[ProcessInitMultisigMessage, SendInitMultisigMessage],
    timeout_secs: MULTISIG_TIMEOUT,
    follow_up: FollowUp::FundMultisigIfReady,
};

pub const BUYER_FUND_MULTISIG: Transition = Transition {
    name: "BuyerFundMultisig",
    on: "FundMultisig",
    allowed_phases: FEE_PUBLISHED,
    tasks: &[FundMultisig],
    timeout_secs: MULTISIG_TIMEOUT,
    follow_up: FollowUp::None,
};

pub const SELLER_FUND_MULTISIG: Transition = Transition {
    name: "SellerFundMultisig",
    on: "FundMultisig",
    allowed_phases: FEE_PUBLISHED,
    tasks: &[FundMultisig, PublishTradeStatistics],
    timeout_secs: MULTISIG_TIMEOUT,
    follow_up: FollowUp::None,
};

// ----------------------------------------------------------------------------
// Per-role listings
// ----------------------------------------------------------------------------

pub const MAKER_BUYER: &[&Transition] = &[
    &MAKER_INPUTS_REQUEST,
    &BUYER_SIGNATURE_REQUEST,
    &BUYER_DEPOSIT_PUBLISHED,
    &BUYER_PAYMENT_STARTED,
    &BUYER_PAYMENT_STARTED_RESEND,
    &BUYER_PAYOUT_PUBLISHED,
    &COMPLETE_TRADE,
    &MAKER_READY_TO_FUND_REQUEST,
    &INIT_MULTISIG,
    &BUYER_FUND_MULTISIG,
];

pub const MAKER_SELLER: &[&Transition] = &[
    &MAKER_INPUTS_REQUEST,
    &SELLER_AS_MAKER_DEPOSIT_TX,
    &SELLER_SIGNATURE_RESPONSE,
    &SELLER_TRANSFER_STARTED,
    &SELLER_PAYMENT_RECEIVED,
    &SELLER_PAYMENT_RECEIVED_RESEND,
    &COMPLETE_TRADE,
    &MAKER_READY_TO_FUND_REQUEST,
    &INIT_MULTISIG,
    &SELLER_FUND_MULTISIG,
];

pub const TAKER_BUYER: &[&Transition] = &[
    &TAKER_TAKE_OFFER,
    &TAKER_BUYER_INPUTS_RESPONSE,
    &BUYER_SIGNATURE_REQUEST,
    &BUYER_DEPOSIT_PUBLISHED,
    &BUYER_PAYMENT_STARTED,
    &BUYER_PAYMENT_STARTED_RESEND,
    &BUYER_PAYOUT_PUBLISHED,
    &COMPLETE_TRADE,
    &TAKER_MULTISIG_TAKE_OFFER,
    &TAKER_RESERVE_TRADE,
    &TAKER_RESEND_READY_TO_FUND,
    &TAKER_MAKER_READY,
    &INIT_MULTISIG,
    &BUYER_FUND_MULTISIG,
];

pub const TAKER_SELLER: &[&Transition] = &[
    &TAKER_TAKE_OFFER,
    &TAKER_SELLER_INPUTS_RESPONSE,
    &SELLER_SIGNATURE_RESPONSE,
    &SELLER_TRANSFER_STARTED,
    &SELLER_PAYMENT_RECEIVED,
    &SELLER_PAYMENT_RECEIVED_RESEND,
    &COMPLETE_TRADE,
    &TAKER_MULTISIG_TAKE_OFFER,
    &TAKER_RESERVE_TRADE,
    &TAKER_RESEND_READY_TO_FUND,
    &TAKER_MAKER_READY,
    &INIT_MULTISIG,
    &SELLER_FUND_MULTISIG,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn position(tasks: &[TaskKind], kind: TaskKind) -> usize {
        tasks
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_else(|| panic!("{} missing", kind))
    }

    #[test]
    fn test_maker_checks_precede_contract() {
        let tasks = MAKER_INPUTS_REQUEST.tasks;
        let contract = position(tasks, MakerCreateAndSignContract);
        assert!(position(tasks, MakerVerifyTakerFeePayment) < contract);
        assert!(position(tasks, VerifyPeersAccountAgeWitness) < contract);
        assert!(contract < position(tasks, MakerCreatesUnsignedDepositTx));
    }

    #[test]
    fn test_deposit_published_after_delayed_payout_signed() {
        let tasks = SELLER_SIGNATURE_RESPONSE.tasks;
        assert!(
            position(tasks, SellerFinalizesDelayedPayoutTx) < position(tasks, SellerPublishesDepositTx)
        );
        // No earlier seller pipeline publishes the deposit
        for transition in [&SELLER_AS_MAKER_DEPOSIT_TX, &TAKER_SELLER_INPUTS_RESPONSE] {
            assert!(!transition.tasks.contains(&SellerPublishesDepositTx));
        }
    }

    #[test]
    fn test_resends_only_resend() {
        assert_eq!(
            BUYER_PAYMENT_STARTED_RESEND.tasks,
            &[BuyerSendsCounterCurrencyTransferStartedMessage]
        );
        assert_eq!(
            SELLER_PAYMENT_RECEIVED_RESEND.tasks,
            &[SellerSendPayoutTxPublishedMessage]
        );
        // The resend phases never overlap the full pipelines
        for phase in BUYER_PAYMENT_STARTED_RESEND.allowed_phases {
            assert!(!BUYER_PAYMENT_STARTED.allowed_phases.contains(phase));
        }
        for phase in SELLER_PAYMENT_RECEIVED_RESEND.allowed_phases {
            assert!(!SELLER_PAYMENT_RECEIVED.allowed_phases.contains(phase));
        }
    }

    #[test]
    fn test_listings_have_unique_names() {
        for listing in [MAKER_BUYER, MAKER_SELLER, TAKER_BUYER, TAKER_SELLER] {
            let mut names: Vec<_> = listing.iter().map(|t| t.name).collect();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), listing.len());
        }
    }
}
