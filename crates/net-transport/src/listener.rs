//! Application callbacks for decrypted traffic

use std::path::PathBuf;

use crossbeam_channel::Sender;

/// Receives everything a connection decrypts.
///
/// Called from the connection's receive thread; a slow implementation stalls
/// that connection's reads.
pub trait ChannelListener: Send + Sync {
    /// A message frame was opened
    fn on_message(&self, text: String);

    /// A file transfer was fully written to `path`.
    ///
    /// The path is `receive_dir/recv_<name>` for every peer, so concurrent
    /// transfers of the same name from different peers share one file.
    fn on_file_received(&self, path: PathBuf);
}

/// Listener callback as a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(String),
    FileReceived(PathBuf),
}

/// Forwards events to a channel; events are dropped once the receiver is gone
impl ChannelListener for Sender<ChannelEvent> {
    fn on_message(&self, text: String) {
        let _ = self.send(ChannelEvent::Message(text));
    }

    fn on_file_received(&self, path: PathBuf) {
        let _ = self.send(ChannelEvent::FileReceived(path));
    }
}
