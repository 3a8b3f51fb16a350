//! Wire formats spoken between the ipqmux daemon and its peers.
//!
//! * [`control`]: the framed registration / teardown protocol carried on the control stream.
//! * [`data`]: packet and verdict datagrams carried on a peer's data channel.

pub mod control;
pub mod data;
