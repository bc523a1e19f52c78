//! Chat command implementation

use crate::chat::{ChatMessage, ChatTurn, Figure, PersonaChat};
use crate::error::Result;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// Answer one message with no prior history
pub async fn cmd_chat_once(chat: &PersonaChat, figure: &Figure, message: &str) -> Result<ChatTurn> {
    chat.respond(figure, &[], message).await
}

/// Interactive session; history lives only for the session
pub async fn cmd_chat_repl(chat: &PersonaChat, figure: &Figure) -> Result<()> {
    println!("Talking to {}. Empty line or /quit to leave.\n", figure.name);

    let mut history: Vec<ChatMessage> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let message = line.trim();
        if message.is_empty() || message == "/quit" {
            break;
        }

        let turn = chat.respond(figure, &history, message).await?;
        print_chat_turn(figure, &turn, false);

        history.push(ChatMessage::user(message));
        history.push(ChatMessage::assistant(turn.answer));
    }

    info!(figure = %figure.id, turns = history.len() / 2, "Chat session ended");
    Ok(())
}

pub fn print_chat_turn(figure: &Figure, turn: &ChatTurn, show_sources: bool) {
    println!("\n{}> {}\n", figure.name, turn.answer.trim());

    if show_sources && !turn.sources.is_empty() {
        println!("Sources:");
        for source in &turn.sources {
            println!("  - {} [distance: {:.3}]", source.id, source.distance);
        }
    }
}
