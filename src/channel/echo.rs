//! A channel that echoes data and done back to its sender.

use super::{ChannelInput, ChannelIo};

pub async fn run(mut io: ChannelIo) {
    if io.ready().await.is_err() {
        io.close(Some("terminated")).await;
        return;
    }

    while let Some(input) = io.next().await {
        let result = match input {
            ChannelInput::Data(bytes) => io.send_data(bytes).await,
            ChannelInput::Done => io.send_done().await,
            ChannelInput::Control(_) => Ok(()),
        };
        if result.is_err() {
            break;
        }
    }

    io.close(None).await;
}
