use chatlink::{
    ChatContext, ConnectionManager, ConversationController, Notice,
    config::ChatConfig,
    model::{Message, UserId},
    session::{Session, SessionStore},
};
use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Chat with one other user from the terminal.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Bearer token of the logged-in user.
    #[arg(long, env = "CHAT_TOKEN")]
    token: String,

    #[arg(long, env = "CHAT_USER_ID")]
    user_id: String,

    /// Display name shown with your messages.
    #[arg(long)]
    name: Option<String>,

    /// User to talk to.
    peer: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatlink=info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ChatConfig::load();

    let session = SessionStore::new();
    let mut identity = Session::new(args.user_id.as_str(), args.token);
    identity.display_name = args.name.unwrap_or_default();
    session.login(identity);

    let ctx = ChatContext::new(config, session.clone());
    let connection = ConnectionManager::spawn(&ctx);
    let controller = ConversationController::spawn(&ctx, connection.watch_handle());

    let me = UserId::from(args.user_id);
    let chat = controller.start_chat(&UserId::from(args.peer)).await?;
    controller.open(&chat.id).await?;
    info!(chat_id = %chat.id, "conversation open");
    for message in controller.messages() {
        print_message(&me, &message);
    }

    let mut notices = controller.notices();
    let printer = tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(Notice::MessageAppended { message, .. }) if !message.is_from(&me) => print_message(&me, &message),
                Ok(Notice::TypingChanged { users, .. }) if !users.is_empty() => {
                    let names: Vec<_> = users.iter().map(UserId::as_str).collect();
                    eprintln!("({} typing...)", names.join(", "));
                }
                Ok(Notice::Failed { message, .. }) => eprintln!("! {message}"),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        controller.keystroke();
        // Failures already surface through the notice printer.
        let _ = controller.send(&line).await;
    }

    controller.close();
    session.logout();
    printer.abort();
    Ok(())
}

fn print_message(me: &UserId, message: &Message) {
    let who = if message.is_from(me) {
        "you"
    } else {
        message.sender.name.as_deref().unwrap_or(message.sender.id.as_str())
    };
    let at = message.created_at.time();
    println!("[{:02}:{:02}] {who}: {}", at.hour(), at.minute(), message.content);
}
