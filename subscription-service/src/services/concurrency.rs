//! Compare-and-swap mutation of a subscription.

use crate::error::{BillingError, BillingResult};
use crate::models::Subscription;
use crate::services::metrics::record_conflict;
use crate::services::store::BillingTx;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Apply `update` to the subscription if its stored version is
/// `expected_version`, writing it back with the version bumped by one.
///
/// The write is conditional on the version, so a concurrent writer that
/// commits between the read and the write still produces
/// [`BillingError::Conflict`]. The update closure may fail, in which case
/// nothing is written. There is no retry here; callers decide.
#[instrument(skip(tx, update), fields(subscription_id = %subscription_id))]
pub async fn mutate<F, T>(
    tx: &mut dyn BillingTx,
    subscription_id: Uuid,
    expected_version: i64,
    update: F,
) -> BillingResult<(Subscription, T)>
where
    F: FnOnce(&mut Subscription) -> BillingResult<T> + Send,
    T: Send,
{
    let conflict = || {
        record_conflict("mutate");
        warn!(
            subscription_id = %subscription_id,
            expected_version,
            "Stale subscription version"
        );
        BillingError::Conflict {
            subscription_id,
            expected_version,
        }
    };

    let mut subscription = tx
        .get_subscription_for_update(subscription_id)
        .await?
        .ok_or_else(|| BillingError::not_found(format!("Subscription {} not found", subscription_id)))?;

    if subscription.version != expected_version {
        return Err(conflict());
    }

    let value = update(&mut subscription)?;
    subscription.version = expected_version + 1;

    let rows = tx
        .update_subscription_if_version(&subscription, expected_version)
        .await?;
    if rows == 0 {
        return Err(conflict());
    }

    Ok((subscription, value))
}
