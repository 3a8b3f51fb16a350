#![doc(issue_tracker_base_url = "https://example.com/ipqmux/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use ipqmux_common::{MessageQueue, OverflowPolicy, QueueLimit};
pub use ipqmux_daemon::*;
pub use ipqmux_transport::*;
pub use ipqmux_wire::{control, data};
