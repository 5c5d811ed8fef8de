//! 凭据与冷却状态。

mod cooldown;
mod key;

pub use cooldown::{CooldownTracker, DEFAULT_COOLDOWN};
pub use key::{Credential, KeyIdentifier, SUFFIX_LEN, key_suffix};
