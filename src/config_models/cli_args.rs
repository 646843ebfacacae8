use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;

use crate::models::message_log::DEFAULT_RECENT_MESSAGE_CAPACITY;
use crate::models::peer::PeerId;

/// Declarative specification of command-line arguments
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// Identity to present to other peers. Must be unique among participants.
    ///
    /// Defaults to a name derived from the process id.
    #[clap(long)]
    pub peer_id: Option<PeerId>,

    /// IP on which to listen for peer connections.
    #[clap(short, long, default_value = "0.0.0.0")]
    pub listen_addr: IpAddr,

    /// Port on which to listen for peer connections. Use 0 to let the OS
    /// pick one.
    #[clap(long, default_value = "9001")]
    pub peer_port: u16,

    /// IP to publish to the tracker. If unset, the listen address is used if
    /// it is specific, otherwise the address of the outbound interface.
    #[clap(long)]
    pub advertise_ip: Option<IpAddr>,

    /// Host of the rendezvous tracker.
    #[clap(long, default_value = "localhost")]
    pub tracker_host: String,

    /// Port of the rendezvous tracker.
    #[clap(long, default_value = "8001")]
    pub tracker_port: u16,

    /// How long a peer may take to complete the handshake, e.g. `10s`.
    #[clap(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub handshake_timeout: Duration,

    /// How long to wait for an outgoing TCP connection, e.g. `10s`.
    #[clap(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub connect_timeout: Duration,

    /// How long a peer may take to accept one outgoing frame before the
    /// connection to it is dropped, e.g. `10s`.
    #[clap(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub write_timeout: Duration,

    /// Timeout for requests to the tracker, e.g. `10s`.
    #[clap(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub tracker_timeout: Duration,

    /// Number of received messages to keep for `/messages`.
    #[clap(long, default_value_t = DEFAULT_RECENT_MESSAGE_CAPACITY)]
    pub max_recent_messages: usize,

    /// Do not discover and connect to peers automatically after startup.
    #[clap(long)]
    pub no_auto_discover: bool,

    /// Delay before the automatic discovery runs.
    #[clap(long, default_value = "2s", value_parser = humantime::parse_duration)]
    pub auto_discover_delay: Duration,
}

impl Default for Args {
    fn default() -> Self {
        let empty: Vec<String> = vec![];
        Self::parse_from(empty)
    }
}

impl Args {
    /// The configured identity, or one derived from the process id if none
    /// (or a blank one) was given.
    pub fn peer_id(&self) -> PeerId {
        match &self.peer_id {
            Some(peer_id) if !peer_id.is_empty() => peer_id.clone(),
            _ => PeerId::new(format!("peer-{}", std::process::id())),
        }
    }
}
