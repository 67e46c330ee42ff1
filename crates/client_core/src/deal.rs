//! Deal settlement: the `New → InProgress → {Completed, Canceled}` state
//! machine, the two-party balance transfer, and the system-message
//! announcement. Balance updates are read-modify-write against the
//! backend; a transfer intent is recorded locally before anything moves.

use std::sync::Arc;

use async_trait::async_trait;
use backend_api::BackendClient;
use storage::Storage;
use tracing::{error, info, warn};

use shared::{
    domain::{Deal, DealId, DealStatus, Session, TransferIntent},
    error::{ClientError, SettlementStep},
};

use crate::channel::HubChannel;

/// Posts system messages into the deal chat. The hub channel is the real
/// implementation; tests substitute a recorder.
#[async_trait]
pub trait SettlementAnnouncer: Send + Sync {
    async fn announce(&self, deal_id: DealId, text: &str) -> Result<(), ClientError>;
}

#[async_trait]
impl SettlementAnnouncer for HubChannel {
    async fn announce(&self, deal_id: DealId, text: &str) -> Result<(), ClientError> {
        self.send_to(deal_id, text, true).await
    }
}

pub struct DealController {
    api: Arc<BackendClient>,
    storage: Storage,
    announcer: Arc<dyn SettlementAnnouncer>,
}

impl DealController {
    pub fn new(
        api: Arc<BackendClient>,
        storage: Storage,
        announcer: Arc<dyn SettlementAnnouncer>,
    ) -> Self {
        Self {
            api,
            storage,
            announcer,
        }
    }

    /// Intents a previous run left pending. Each one is a settlement that
    /// may have moved money without finishing; they need manual
    /// reconciliation, not silence.
    pub async fn report_unsettled_transfers(&self) -> Result<Vec<TransferIntent>, ClientError> {
        let pending = self
            .storage
            .pending_transfer_intents()
            .await
            .map_err(|err| ClientError::Storage(err.to_string()))?;
        for intent in &pending {
            warn!(
                intent_id = %intent.intent_id,
                deal_id = intent.deal_id.0,
                amount = intent.amount,
                "settlement: unfinished transfer intent from a previous run"
            );
        }
        Ok(pending)
    }

    /// Cancels an in-progress deal: refund the advertiser, flip the
    /// status, announce. The refund failing aborts the whole operation;
    /// nothing after it is attempted.
    pub async fn cancel(&self, deal: &Deal, actor: &Session) -> Result<Deal, ClientError> {
        guard_transition(deal, actor)?;

        let intent = self
            .storage
            .record_transfer_intent(deal.id, deal.advertiser_id, deal.advertiser_id, deal.cost)
            .await
            .map_err(|err| ClientError::Storage(err.to_string()))?;
        info!(
            deal_id = deal.id.0,
            intent_id = %intent.intent_id,
            amount = deal.cost,
            "deal: canceling with refund"
        );

        if let Err(err) = self.api.adjust_balance(deal.advertiser_id, deal.cost).await {
            let _ = self.storage.mark_transfer_failed(intent.intent_id).await;
            return Err(err);
        }

        if let Err(err) = self
            .api
            .update_deal_status(deal.id, DealStatus::Canceled)
            .await
        {
            return Err(self.partial(
                &intent,
                "cancel deal",
                SettlementStep::RefundAdvertiser,
                SettlementStep::UpdateStatus,
                err,
            ));
        }
        self.settle_intent(&intent).await;

        let text = format!("Сделка отменена. {} возвращены рекламодателю", format_rub(deal.cost));
        if let Err(err) = self.announcer.announce(deal.id, &text).await {
            return Err(self.partial(
                &intent,
                "cancel deal",
                SettlementStep::UpdateStatus,
                SettlementStep::Announce,
                err,
            ));
        }

        info!(deal_id = deal.id.0, "deal: canceled");
        Ok(Deal {
            status: DealStatus::Canceled,
            ..deal.clone()
        })
    }

    /// Completes an in-progress deal: debit the advertiser, credit the
    /// content-maker, flip the status, announce. A failed debit aborts
    /// everything; failures after the debit are partial — funds already
    /// moved are not rolled back, the intent row records what happened.
    pub async fn complete(&self, deal: &Deal, actor: &Session) -> Result<Deal, ClientError> {
        guard_transition(deal, actor)?;

        let intent = self
            .storage
            .record_transfer_intent(deal.id, deal.advertiser_id, deal.platform_id, deal.cost)
            .await
            .map_err(|err| ClientError::Storage(err.to_string()))?;
        info!(
            deal_id = deal.id.0,
            intent_id = %intent.intent_id,
            amount = deal.cost,
            "deal: completing with settlement"
        );

        if let Err(err) = self.api.adjust_balance(deal.advertiser_id, -deal.cost).await {
            let _ = self.storage.mark_transfer_failed(intent.intent_id).await;
            return Err(err);
        }

        if let Err(err) = self.api.adjust_balance(deal.platform_id, deal.cost).await {
            return Err(self.partial(
                &intent,
                "complete deal",
                SettlementStep::DebitAdvertiser,
                SettlementStep::CreditContentMaker,
                err,
            ));
        }

        if let Err(err) = self
            .api
            .update_deal_status(deal.id, DealStatus::Completed)
            .await
        {
            return Err(self.partial(
                &intent,
                "complete deal",
                SettlementStep::CreditContentMaker,
                SettlementStep::UpdateStatus,
                err,
            ));
        }
        self.settle_intent(&intent).await;

        let text = format!("{} переведены контент-мейкеру", format_rub(deal.cost));
        if let Err(err) = self.announcer.announce(deal.id, &text).await {
            return Err(self.partial(
                &intent,
                "complete deal",
                SettlementStep::UpdateStatus,
                SettlementStep::Announce,
                err,
            ));
        }

        info!(deal_id = deal.id.0, "deal: completed");
        Ok(Deal {
            status: DealStatus::Completed,
            ..deal.clone()
        })
    }

    async fn settle_intent(&self, intent: &TransferIntent) {
        if let Err(err) = self.storage.mark_transfer_settled(intent.intent_id).await {
            warn!(intent_id = %intent.intent_id, "settlement: could not mark intent settled: {err}");
        }
    }

    /// Out-of-sync financial state: logged loudly and surfaced as a
    /// distinct error kind so callers cannot collapse it into a generic
    /// failure message.
    fn partial(
        &self,
        intent: &TransferIntent,
        operation: &'static str,
        completed: SettlementStep,
        failed: SettlementStep,
        source: ClientError,
    ) -> ClientError {
        error!(
            intent_id = %intent.intent_id,
            deal_id = intent.deal_id.0,
            amount = intent.amount,
            %completed,
            %failed,
            "settlement: partial failure, manual reconciliation required: {source}"
        );
        ClientError::PartialFailure {
            operation,
            completed,
            failed,
            message: source.to_string(),
        }
    }
}

/// All transition guards run before any network call: only the
/// advertiser party may settle, only in-progress deals transition, and
/// terminal states stay immutable.
fn guard_transition(deal: &Deal, actor: &Session) -> Result<(), ClientError> {
    if actor.user_id != deal.advertiser_id {
        return Err(ClientError::Validation(
            "only the deal's advertiser may change its status".into(),
        ));
    }
    if deal.status != DealStatus::InProgress {
        return Err(ClientError::Validation(format!(
            "deal {} is not in progress and cannot transition",
            deal.id.0
        )));
    }
    if deal.cost <= 0 {
        return Err(ClientError::Validation(format!(
            "deal {} has a non-positive cost",
            deal.id.0
        )));
    }
    Ok(())
}

/// Ruble amount with thousands separated by spaces: 10000 → "10 000 ₽".
pub fn format_rub(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 2);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(ch);
    }
    let sign = if amount < 0 { "-" } else { "" };
    format!("{sign}{grouped} ₽")
}
