//! A channel that swallows everything sent to it.

use super::{ChannelInput, ChannelIo};

pub async fn run(mut io: ChannelIo) {
    if io.ready().await.is_err() {
        io.close(Some("terminated")).await;
        return;
    }

    while let Some(input) = io.next().await {
        match input {
            ChannelInput::Data(_) | ChannelInput::Done => {}
            ChannelInput::Control(_) => {}
        }
    }

    io.close(None).await;
}
