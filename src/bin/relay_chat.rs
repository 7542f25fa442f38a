//! Terminal chat client for a running relay. Ctrl-C stops the reply being
//! streamed; the interrupted message is offered again for resubmission.

use std::env;
use std::io::Write;

use stream_relay::client::{Conversation, RelayClient, StreamEnd};
use stream_relay::config::DEFAULT_MODEL;
use stream_relay::frame::StreamFrame;
use stream_relay::message::ChatMessage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::Level;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(
            env::var("RUST_LOG")
                .ok()
                .and_then(|s| s.parse::<Level>().ok())
                .unwrap_or(Level::WARN),
        )
        .with_writer(std::io::stderr)
        .init();

    let base_url = env::var("RELAY_URL").unwrap_or_else(|_| "http://127.0.0.1:3000".to_string());
    let model = env::var("RELAY_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

    let client = RelayClient::new(base_url);
    let mut conversation = Conversation::new(model);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    println!("model: {} (Ctrl-C interrupts a reply, Ctrl-D quits)", conversation.model());
    loop {
        if !conversation.input().is_empty() {
            println!("(interrupted, press enter to resend: {})", conversation.input());
        }
        print!("> ");
        let _ = std::io::stdout().flush();

        let line = match stdin.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("failed to read input: {}", e);
                break;
            }
        };
        if !line.trim().is_empty() {
            conversation.set_input(line);
        }
        let Some(turn) = conversation.begin_turn() else {
            continue;
        };

        let cancel = CancellationToken::new();
        let interrupt = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            }
        });

        let (consumer, end) = client
            .stream_turn(&turn, &cancel, |_, frame| {
                if let StreamFrame::Text { data, .. } = frame {
                    print!("{}", data);
                    let _ = std::io::stdout().flush();
                }
            })
            .await;
        interrupt.abort();
        println!();

        conversation.finish_turn(turn, consumer, end_or_interrupted(end, &cancel));
        if let Some(reply) = conversation.messages().last() {
            print_footer(reply);
        }
    }
}

fn end_or_interrupted(end: StreamEnd, cancel: &CancellationToken) -> StreamEnd {
    // a transport error caused by our own interrupt is still an interrupt
    match end {
        StreamEnd::Failed(_) if cancel.is_cancelled() => StreamEnd::Cancelled,
        other => other,
    }
}

fn print_footer(reply: &ChatMessage) {
    let mut info = Vec::new();
    if let Some(model) = &reply.model {
        info.push(model.clone());
    }
    if let Some(tokens) = reply.tokens {
        info.push(format!("{} tokens", tokens));
    }
    if reply.aborted {
        info.push("interrupted".to_string());
    }
    if reply.content == stream_relay::client::ERROR_MESSAGE {
        println!("{}", reply.content);
    }
    println!("[{}]", info.join(" · "));
}
