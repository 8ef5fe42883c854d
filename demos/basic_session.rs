use std::io::Write;
use std::sync::Arc;

use tutorstream::{
    ChatClient, ChatSession, Result, SessionEvent, SessionScope, StaticToken, TurnSignal,
    TutorLevel,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Read the bearer token from the environment variable TUTORSTREAM_TOKEN
    let token = std::env::var("TUTORSTREAM_TOKEN")
        .expect("set TUTORSTREAM_TOKEN to run this example");

    let scope = SessionScope::ReviewTest {
        review_card_id: "demo-card".to_string(),
        tutor_level: TutorLevel::Intermediate,
    };
    let client = ChatClient::new(scope, Arc::new(StaticToken(token)))?;

    let mut session = ChatSession::new(client.clone());
    let mut rx = session.subscribe();

    let mut assembler = tutorstream::MessageAssembler::new();
    while let Some(event) = rx.recv().await {
        match &event {
            SessionEvent::Connected => {
                println!("Connected; starting the review test.");
                client.send_message("ready").await?;
            }
            SessionEvent::Fragment(text) => {
                print!("{text}");
                std::io::stdout().flush().ok();
            }
            SessionEvent::Done => println!(),
            SessionEvent::Error(e) => {
                eprintln!("Session ended: {e}");
                break;
            }
        }
        if assembler.apply(&event) == TurnSignal::TestCompleted {
            println!("Test complete; {} messages total.", assembler.messages().len());
            break;
        }
    }

    session.disconnect();
    Ok(())
}
