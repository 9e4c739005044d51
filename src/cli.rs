//! Command-line front end.

use crate::auth::Session;
use crate::client::Client;
use crate::config::Config;
use crate::conversation::{ControlSignal, DeliveryState, Message, Role, SmartForm};
use crate::workflow::ExecutionPlan;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;

/// Chat and workflow backend client
#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Store session tokens
    Login(LoginArgs),
    /// Clear the stored session
    Logout,
    /// Send a message and print the reply
    Send {
        conversation: String,
        message: String,
    },
    /// Fetch and print a conversation's transcript
    History { conversation: String },
    /// Print the cached execution plan for a conversation
    Plan { conversation: String },
}

#[derive(Parser, Debug)]
pub struct LoginArgs {
    #[arg(long)]
    pub access_token: String,

    #[arg(long)]
    pub refresh_token: Option<String>,

    /// Access token lifetime in seconds
    #[arg(long)]
    pub expires_in: Option<u64>,
}

/// Install the stderr log subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "tether=debug" } else { "tether=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run(cli: Cli) -> ExitCode {
    init_tracing(cli.verbose);

    match execute(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Commands) -> Result<ExitCode> {
    let config = Config::load().context("Failed to load config")?;
    let client = Client::from_config(&config).context("Failed to initialize client")?;

    match command {
        Commands::Login(args) => {
            let mut session = Session::new(args.access_token, args.refresh_token);
            if let Some(secs) = args.expires_in {
                session = session.expires_in(secs);
            }
            client.session().login(session)?;
            println!("Logged in.");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Logout => {
            client.session().logout()?;
            println!("Logged out.");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Send {
            conversation,
            message,
        } => send(&client, &conversation, &message).await,
        Commands::History { conversation } => {
            let messages = client.conversations().fetch_history(&conversation).await?;
            for message in &messages {
                print_message(message);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan { conversation } => {
            match client.cache().load(&conversation)? {
                Some(plan) => print_plan(&plan),
                None => println!("No cached plan for {conversation}."),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn send(client: &Client, conversation: &str, text: &str) -> Result<ExitCode> {
    let pending = client.conversations().send(conversation, Role::User, text)?;
    let message_id = pending.message_id.clone();

    let reply = match pending.outcome().await {
        Ok(reply) => reply,
        Err(e) => {
            let shown = client
                .conversations()
                .message(conversation, &message_id)
                .and_then(|m| m.error)
                .unwrap_or_else(|| e.to_string());
            eprintln!("Message not delivered: {shown}");
            return Ok(ExitCode::FAILURE);
        }
    };

    if !reply.reply.trim().is_empty() {
        println!("{}", reply.reply);
    }
    for signal in &reply.signals {
        match signal {
            ControlSignal::AuthorizationRequired(requests) => {
                println!("\nAuthorization required:");
                for request in requests {
                    let url = request.authorization_url.as_deref().unwrap_or("-");
                    println!("  {} ({}): {}", request.display_name, request.service_id, url);
                }
            }
            ControlSignal::FormRequested(form) => print_form(form),
        }
    }
    if let Some(plan) = &reply.execution_plan {
        println!();
        print_plan(plan);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_message(message: &Message) {
    let marker = match message.delivery {
        DeliveryState::Sending => " (sending)",
        DeliveryState::Failed => " (failed)",
        DeliveryState::Sent | DeliveryState::Received => "",
    };
    println!(
        "[{}] {}{}: {}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        message.role,
        marker,
        message.content
    );
}

fn print_form(form: &SmartForm) {
    println!("\n{}", form.title.as_deref().unwrap_or("More information needed"));
    if let Some(description) = &form.description {
        println!("  {description}");
    }
    for field in &form.fields {
        let label = field.label.as_deref().unwrap_or(&field.name);
        let required = if field.required { " *" } else { "" };
        println!("  - {label} [{}]{required}", field.kind);
    }
}

fn print_plan(plan: &ExecutionPlan) {
    println!("Plan:");
    for (i, step) in plan.steps.iter().enumerate() {
        let status = step.status.as_deref().unwrap_or("pending");
        match &step.tool {
            Some(tool) => println!("  {}. {} [{tool}] ({status})", i + 1, step.title),
            None => println!("  {}. {} ({status})", i + 1, step.title),
        }
    }
}
