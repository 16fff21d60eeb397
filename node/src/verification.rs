//! Order limit, order, and piece hash verification.
//!
//! Checks run cheapest-first: structural validation, addressing, freshness,
//! then signatures, and only after everything else passes is the serial
//! recorded in the used-serials cache, so a rejected limit never burns its
//! serial.

use crate::error::RpcError;
use crate::state::AppState;
use common::{Order, OrderLimit, PieceHash};

/// Validate an order limit for this node and record its serial.
///
/// The caller has already checked that the action matches the handler.
pub fn verify_order_limit(state: &AppState, limit: &OrderLimit, now: u64) -> Result<(), RpcError> {
    if limit.piece_id.is_zero() {
        return Err(RpcError::invalid_argument("missing piece id"));
    }
    if limit.serial.is_zero() {
        return Err(RpcError::invalid_argument("missing serial number"));
    }
    if limit.node_id != state.node_id {
        return Err(RpcError::permission_denied(format!(
            "order limit intended for other storage node: {}",
            limit.node_id
        )));
    }
    if now > limit.order_expiration {
        return Err(RpcError::unauthenticated("order limit expired"));
    }
    if now > limit.issued_at.saturating_add(state.config.order_limit_grace_secs) {
        return Err(RpcError::unauthenticated(
            "order limit grace period passed, too old to accept",
        ));
    }
    if limit.piece_expiration != 0 && limit.piece_expiration < now {
        return Err(RpcError::invalid_argument("piece is already expired"));
    }

    let Some(coordinator_key) = state.trust.verifying_key(&limit.coordinator_id) else {
        return Err(RpcError::unauthenticated(format!(
            "untrusted coordinator: {}",
            limit.coordinator_id
        )));
    };
    if !limit.verify_signature(coordinator_key) {
        return Err(RpcError::unauthenticated("invalid order limit signature"));
    }

    state
        .used_serials
        .insert(&limit.coordinator_id, limit.serial, limit.order_expiration, now)
        .map_err(|_| RpcError::already_exists("serial number already used"))?;
    state
        .metrics
        .used_serials
        .set(state.used_serials.len() as i64);
    Ok(())
}

/// Validate an in-session order against its limit and the running largest
/// amount.
pub fn verify_order(
    limit: &OrderLimit,
    order: &Order,
    prev_amount: u64,
) -> Result<(), RpcError> {
    if order.serial != limit.serial {
        return Err(RpcError::invalid_argument(format!(
            "order serial {} does not match limit serial {}",
            order.serial, limit.serial
        )));
    }
    if order.amount < prev_amount {
        return Err(RpcError::invalid_argument(format!(
            "order contained smaller amount={} than previous amount={}",
            order.amount, prev_amount
        )));
    }
    if order.amount > limit.byte_limit {
        return Err(RpcError::invalid_argument(format!(
            "order amount {} exceeds limit {}",
            order.amount, limit.byte_limit
        )));
    }
    let Some(uplink_key) = common::signing::verifying_key(&limit.uplink_key) else {
        return Err(RpcError::invalid_argument("invalid uplink key in limit"));
    };
    if !order.verify_signature(&uplink_key) {
        return Err(RpcError::invalid_argument("invalid order signature"));
    }
    Ok(())
}

/// Validate the uplink's terminal done-hash against the streaming hash the
/// writer computed.
pub fn verify_piece_hash(
    limit: &OrderLimit,
    done: &PieceHash,
    computed: &[u8; 32],
) -> Result<(), RpcError> {
    if done.piece_id != limit.piece_id {
        return Err(RpcError::invalid_argument(format!(
            "done hash piece id {} does not match limit piece id {}",
            done.piece_id, limit.piece_id
        )));
    }
    let Some(uplink_key) = common::signing::verifying_key(&limit.uplink_key) else {
        return Err(RpcError::invalid_argument("invalid uplink key in limit"));
    };
    if !done.verify_signature(&uplink_key) {
        return Err(RpcError::invalid_argument("invalid piece hash signature"));
    }
    if &done.hash != computed {
        return Err(RpcError::invalid_argument(format!(
            "piece hash mismatch, uplink={} computed={}",
            hex::encode(done.hash),
            hex::encode(computed)
        )));
    }
    Ok(())
}
