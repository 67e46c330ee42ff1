use anyhow::Result;
use clap::Parser;
use client_core::{
    deal::format_rub, load_settings, ChannelState, ClientEvent, ConfirmState, ConfirmationGate,
    DealChatClient,
};
use shared::domain::DealId;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    /// Deal whose chat to open.
    #[arg(long)]
    deal_id: i64,
    /// Overrides base_url from client.toml / APP__BASE_URL.
    #[arg(long)]
    base_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(base_url) = args.base_url {
        settings.base_url = base_url;
    }

    let client = DealChatClient::new(settings).await?;
    let mut events = client.subscribe_events();

    let session = client.login(&args.email, &args.password).await?;
    println!("Вошли как пользователь {}", session.user_id.0);

    let chat = client.open_deal(DealId(args.deal_id)).await?;
    let deal = chat.deal().clone();
    println!(
        "Сделка {} на {}, статус {:?}",
        deal.id.0,
        format_rub(deal.cost),
        deal.status
    );

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::MessageReceived(message) => {
                    let who = if message.is_system {
                        "система".to_string()
                    } else {
                        message
                            .sender_name
                            .clone()
                            .unwrap_or_else(|| message.sender_id.0.to_string())
                    };
                    println!(
                        "[{}] {}: {}",
                        message.timestamp.format("%H:%M"),
                        who,
                        message.text
                    );
                }
                ClientEvent::HistoryMerged { page, has_more, .. } => {
                    println!(
                        "— история: страница {page}{}",
                        if has_more { ", есть ещё" } else { "" }
                    );
                }
                ClientEvent::DealUpdated(deal) => {
                    println!("— статус сделки: {:?}", deal.status);
                }
                ClientEvent::Reconnecting => {
                    println!("… соединение потеряно, переподключение; отправка недоступна");
                }
                ClientEvent::Reconnected => println!("… соединение восстановлено"),
                ClientEvent::ConnectionClosed => println!("… соединение закрыто"),
                ClientEvent::HubError(message) => eprintln!("ошибка хаба: {message}"),
                ClientEvent::Error(message) => eprintln!("ошибка: {message}"),
            }
        }
    });

    println!("Введите сообщение; /cancel, /complete или /quit");
    let gate = ConfirmationGate::new();
    let controller = client.deal_controller();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        match line.as_str() {
            "" => continue,
            "/quit" => break,
            "/cancel" | "/complete" => {
                let Some(session) = client.session().await else {
                    continue;
                };
                let verb = if line == "/cancel" {
                    "отменить"
                } else {
                    "завершить"
                };
                gate.present(format!(
                    "Вы уверены, что хотите {verb} сделку {}? (y/n)",
                    chat.deal().id.0
                ))?;
                if let ConfirmState::Presented { prompt } = gate.state() {
                    println!("{prompt}");
                }
                let Some(answer) = lines.next_line().await? else {
                    break;
                };
                gate.resolve(matches!(answer.trim(), "y" | "Y" | "да"))?;
                if gate.take_decision() != Some(true) {
                    println!("Действие отменено");
                    continue;
                }

                let result = if line == "/cancel" {
                    controller.cancel(chat.deal(), &session).await
                } else {
                    controller.complete(chat.deal(), &session).await
                };
                match result {
                    Ok(updated) => println!("Статус сделки: {:?}", updated.status),
                    Err(err) if err.is_partial_failure() => {
                        eprintln!("ЧАСТИЧНЫЙ СБОЙ, требуется сверка балансов: {err}");
                    }
                    Err(err) => eprintln!("Не удалось: {err}"),
                }
            }
            text => {
                if client.channel().state() != ChannelState::Connected {
                    eprintln!("Нет соединения — сообщение не отправлено");
                    continue;
                }
                if let Err(err) = chat.send(text).await {
                    eprintln!("Не удалось отправить: {err}");
                }
            }
        }
    }

    client.logout().await?;
    Ok(())
}
