//! Cancellation reason codes.
//!
//! The numeric taxonomy is part of the wire contract between producers and
//! consumers and must remain stable: producer-side codes are 1xx, consumer
//! (agbot) side codes are 2xx. The codes travel in `Cancel` messages and in
//! anchor termination records.

/// Producer: agreement never confirmed on the anchor in time.
pub const CANCEL_NOT_FINALIZED_TIMEOUT: u32 = 100;
/// Producer: local policy changed and no longer matches.
pub const CANCEL_POLICY_CHANGED: u32 = 101;
/// Producer: workload container terminated.
pub const CANCEL_CONTAINER_FAILURE: u32 = 103;
/// Producer: workload did not start in time.
pub const CANCEL_NOT_EXECUTED_TIMEOUT: u32 = 104;
/// Producer: user requested cancellation on the node.
pub const CANCEL_USER_REQUESTED: u32 = 105;
/// Producer: the consumer asked for the cancellation.
pub const CANCEL_AGBOT_REQUESTED: u32 = 106;
/// Producer: no reply-ack received for an accepted proposal.
pub const CANCEL_NO_REPLY_ACK: u32 = 107;
/// Producer: a dependent service failed.
pub const CANCEL_SERVICE_FAILURE: u32 = 108;
/// Producer: workload image failed to load.
pub const CANCEL_WL_IMAGE_LOAD_FAILURE: u32 = 109;
/// Producer: dependent service image failed to load.
pub const CANCEL_SERVICE_IMAGE_LOAD_FAILURE: u32 = 110;
/// Producer: cancellation required by a service upgrade.
pub const CANCEL_SERVICE_UPGRADE_REQUIRED: u32 = 111;
/// Producer: image data was corrupt.
pub const CANCEL_IMAGE_DATA_ERROR: u32 = 112;
/// Producer: image fetch failed.
pub const CANCEL_IMAGE_FETCH_FAILURE: u32 = 113;
/// Producer: image fetch was not authorized.
pub const CANCEL_IMAGE_FETCH_AUTH_FAILURE: u32 = 114;
/// Producer: image signature did not verify.
pub const CANCEL_IMAGE_SIG_VERIF_FAILURE: u32 = 115;
/// Producer: the node is being unconfigured.
pub const CANCEL_NODE_SHUTDOWN: u32 = 116;
/// Producer: dependent service image fetch failed.
pub const CANCEL_SERVICE_IMAGE_FETCH_FAILURE: u32 = 117;
/// Producer: service is being downgraded to an older version.
pub const CANCEL_SERVICE_DOWNGRADE_REQUIRED: u32 = 118;

/// Consumer: agreement never confirmed on the anchor in time.
pub const AB_CANCEL_NOT_FINALIZED_TIMEOUT: u32 = 200;
/// Consumer: no reply to the proposal.
pub const AB_CANCEL_NO_REPLY: u32 = 201;
/// Consumer: the producer replied with a rejection.
pub const AB_CANCEL_NEGATIVE_REPLY: u32 = 202;
/// Consumer: no data received within the verification window.
pub const AB_CANCEL_NO_DATA_RECEIVED: u32 = 203;
/// Consumer: local policy changed and no longer matches.
pub const AB_CANCEL_POLICY_CHANGED: u32 = 204;
/// Consumer: discovered a producer-side cancellation on the anchor.
pub const AB_CANCEL_DISCOVERED: u32 = 205;
/// Consumer: user requested cancellation.
pub const AB_USER_REQUESTED: u32 = 206;
/// Consumer: forced workload upgrade.
pub const AB_CANCEL_FORCED_UPGRADE: u32 = 207;
/// Consumer: the anchor write for the agreement failed.
pub const AB_CANCEL_BC_WRITE_FAILED: u32 = 208;
/// Consumer: the node stopped heartbeating.
pub const AB_CANCEL_NODE_HEARTBEAT: u32 = 209;
/// Consumer: the agreement vanished from the node's directory record.
pub const AB_CANCEL_AG_MISSING: u32 = 210;

/// Returns the operator-facing meaning of a reason code.
///
/// Unknown codes are reported as such rather than failing; the counter
/// party may be running a newer level of the taxonomy.
#[must_use]
pub fn describe(code: u32) -> &'static str {
    match code {
        CANCEL_NOT_FINALIZED_TIMEOUT => "agreement never appeared on the anchor",
        CANCEL_POLICY_CHANGED => "producer policy changed",
        CANCEL_CONTAINER_FAILURE => "workload terminated",
        CANCEL_NOT_EXECUTED_TIMEOUT => "workload start timeout",
        CANCEL_USER_REQUESTED => "user requested",
        CANCEL_AGBOT_REQUESTED => "consumer requested",
        CANCEL_NO_REPLY_ACK => "agreement protocol incomplete, no reply ack received",
        CANCEL_SERVICE_FAILURE => "dependent service failed",
        CANCEL_WL_IMAGE_LOAD_FAILURE => "workload image loading failed",
        CANCEL_SERVICE_IMAGE_LOAD_FAILURE => "service image loading failed",
        CANCEL_SERVICE_UPGRADE_REQUIRED => "required by service upgrade process",
        CANCEL_IMAGE_DATA_ERROR => "image data error",
        CANCEL_IMAGE_FETCH_FAILURE => "image fetching failed",
        CANCEL_IMAGE_FETCH_AUTH_FAILURE => "authorization failed for image fetching",
        CANCEL_IMAGE_SIG_VERIF_FAILURE => "image signature verification failed",
        CANCEL_NODE_SHUTDOWN => "node was unconfigured",
        CANCEL_SERVICE_IMAGE_FETCH_FAILURE => "service image fetching failed",
        CANCEL_SERVICE_DOWNGRADE_REQUIRED => "service failed, downgrading to lower version",
        AB_CANCEL_NOT_FINALIZED_TIMEOUT => "consumer never detected the agreement on the anchor",
        AB_CANCEL_NO_REPLY => "consumer never received a reply to the proposal",
        AB_CANCEL_NEGATIVE_REPLY => "consumer received a negative reply",
        AB_CANCEL_NO_DATA_RECEIVED => "consumer did not detect data",
        AB_CANCEL_POLICY_CHANGED => "consumer policy changed",
        AB_CANCEL_DISCOVERED => "consumer discovered cancellation from the producer",
        AB_USER_REQUESTED => "consumer user requested",
        AB_CANCEL_FORCED_UPGRADE => "consumer user requested workload upgrade",
        AB_CANCEL_BC_WRITE_FAILED => "consumer anchor write failed",
        AB_CANCEL_NODE_HEARTBEAT => "consumer detected node heartbeat stopped",
        AB_CANCEL_AG_MISSING => "consumer detected agreement missing from node",
        _ => "unknown reason code, counter party might be downlevel",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        // Interop depends on these exact values.
        assert_eq!(CANCEL_NOT_FINALIZED_TIMEOUT, 100);
        assert_eq!(CANCEL_SERVICE_DOWNGRADE_REQUIRED, 118);
        assert_eq!(AB_CANCEL_NOT_FINALIZED_TIMEOUT, 200);
        assert_eq!(AB_CANCEL_AG_MISSING, 210);
    }

    #[test]
    fn test_describe_unknown() {
        assert_eq!(
            describe(999),
            "unknown reason code, counter party might be downlevel"
        );
    }
}
