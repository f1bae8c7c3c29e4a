/// Hash chain over operations applied to an environment
///
/// An environment's hash is `advance(prev, op, args)` folded over every
/// operation it has seen, starting from a seed derived from where it lives and
/// how it was provisioned. Two environments that went through the same
/// sequence of operations from the same seed share a hash, which is what lets
/// a fresh environment pick up cached results.
use serde_json::{json, Value};

use crate::digest::digest_json;
use crate::environment::{EnvIdentity, Provisioning};
use crate::error::Result;

/// Next hash in the chain
///
/// `args` must already be normalized. The digest covers `{args, op, prev}`
/// with sorted keys.
pub fn advance(prev: &str, op: &str, args: &Value) -> Result<String> {
    digest_json(&json!({
        "prev": prev,
        "op": op,
        "args": args,
    }))
}

/// Starting hash of an environment
pub fn seed(identity: &EnvIdentity, provisioning: &Provisioning) -> Result<String> {
    digest_json(&json!({
        "identity": identity,
        "provisioning": provisioning,
    }))
}
