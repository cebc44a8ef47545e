//! # Causeway Node
//!
//! A standalone CLI process taking part in causal-order multicast over TCP.
//!
//! ```text
//! causeway-node check --config roster.json
//! causeway-node run --config roster.json --name alice
//! causeway-node demo
//! ```
//!
//! While running, every line read from stdin is multicast to all of the
//! node's groups; `/g <group> <text>` targets one group. Deliveries are
//! printed as they arrive. Fault rules in the roster file are re-read while
//! the node runs.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use causeway_core::{clock_for, ClockKind, FaultRule, MessageKind, Roster, RuleSet, WireMessage};
use causeway_multicast::{GroupStats, Multicast, MulticastConfigBuilder};
use causeway_transport::{
    create_network, FileRuleSource, RuleBook, RuleWatcher, TcpTransport, Transport,
    TransportConfig,
};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

type AnyResult<T> = std::result::Result<T, Box<dyn Error>>;

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "causeway-node")]
#[command(about = "Causal-order reliable multicast node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the roster as one process and multicast lines from stdin
    Run {
        /// Roster file (contacts, groups, fault rules)
        #[arg(long)]
        config: PathBuf,
        /// This process's name in the roster
        #[arg(long)]
        name: String,
        /// Clock stamped on every transport message
        #[arg(long, value_enum, default_value_t = ClockArg::Logical)]
        clock: ClockArg,
        /// Milliseconds to wait for acknowledgements before resending
        #[arg(long, default_value_t = 10_000)]
        retransmit_ms: u64,
    },
    /// Validate a roster file and print it
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// In-process walkthrough: a reply held back until its cause arrives
    Demo,
}

#[derive(Clone, Copy, ValueEnum)]
enum ClockArg {
    Logical,
    Vector,
}

impl From<ClockArg> for ClockKind {
    fn from(arg: ClockArg) -> Self {
        match arg {
            ClockArg::Logical => ClockKind::Logical,
            ClockArg::Vector => ClockKind::Vector,
        }
    }
}

fn setup_log() {
    let _ = SubscriberBuilder::default()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .finish()
        .try_init();
}

// ─── Pretty printing ──────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn show_roster(roster: &Roster) {
    section("Processes");
    for contact in &roster.contacts {
        step(&format!("{:<12} {}", contact.name.bright_magenta(), contact.address()));
    }

    section("Groups");
    for group in &roster.groups {
        step(&format!("{:<12} [{}]", group.name.bright_yellow(), group.members.join(", ")));
    }

    section("Fault rules");
    let rules = [("send", &roster.send_rules), ("receive", &roster.receive_rules)];
    for (side, set) in rules {
        if set.is_empty() {
            step(&format!("{:<8} {}", side, "(none)".dimmed()));
        }
        for rule in set.iter() {
            step(&format!("{:<8} {}", side, describe_rule(rule)));
        }
    }
}

fn describe_rule(rule: &FaultRule) -> String {
    let mut parts = vec![format!("{:?}", rule.action).to_lowercase().bright_red().to_string()];
    if let Some(src) = &rule.src {
        parts.push(format!("src={}", src));
    }
    if let Some(dest) = &rule.dest {
        parts.push(format!("dest={}", dest));
    }
    if let Some(kind) = rule.kind {
        parts.push(format!("kind={}", kind));
    }
    if let Some(seq) = rule.seq_num {
        parts.push(format!("seq={}", seq));
    }
    if let Some(dupe) = rule.dupe {
        parts.push(format!("dupe={}", dupe));
    }
    if let Some(limit) = rule.limit {
        parts.push(format!("limit={}", limit));
    }
    parts.join(" ")
}

fn show_delivery(message: &WireMessage) {
    let vector = message
        .vector
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_default();
    println!(
        "  {} {} {} {} {}",
        format!("[{}]", message.group).bright_yellow(),
        message.source.bright_magenta(),
        "▶".bright_cyan(),
        message.text(),
        vector.dimmed()
    );
}

fn show_stats(stats: &GroupStats) {
    let border = "─".repeat(44);
    println!("  ┌{}┐", border);
    println!(
        "  │ {:^42} │",
        format!("Group: {}", stats.group).bright_yellow().to_string()
    );
    println!("  ├{}┤", border);
    let rows = [
        ("vector", stats.vector.to_string()),
        ("delivered", stats.delivered.to_string()),
        ("held back", stats.held_back.to_string()),
        ("pending sends", stats.pending_sends.to_string()),
        ("duplicates", stats.duplicates.to_string()),
        ("retransmissions", stats.retransmissions.to_string()),
    ];
    for (label, value) in rows {
        println!("  │ {:<42} │", format!("{:<16} {}", label, value));
    }
    println!("  └{}┘", border);
}

fn fail(err: impl std::fmt::Display) {
    println!("  {} {}", "!".bright_red(), err);
}

// ─── Check ─────────────────────────────────────────────────────────────────

fn run_check(config: &Path) -> AnyResult<()> {
    let roster = Roster::load(config)?;
    header(&format!("ROSTER — {}", config.display()));
    show_roster(&roster);
    println!(
        "\n  {} {}",
        "✓".bright_green().bold(),
        "roster is valid".bright_green().bold()
    );
    Ok(())
}

// ─── Run ───────────────────────────────────────────────────────────────────

async fn run_node(config: PathBuf, name: String, clock: ClockKind, retransmit_ms: u64) -> AnyResult<()> {
    let roster = Roster::load(&config)?;
    roster.require_process(&name)?;
    let directory = roster.directory();
    let own = directory
        .index_of(&name)
        .ok_or_else(|| format!("{} is not in the contact directory", name))?;

    let book = Arc::new(RuleBook::new(roster.send_rules.clone(), roster.receive_rules.clone()));
    let transport_config = TransportConfig::default();
    let transport = Arc::new(
        TcpTransport::bind(
            name.clone(),
            directory.clone(),
            book.view(),
            clock_for(clock, own, directory.len()),
            transport_config.clone(),
        )
        .await?,
    );

    let multicast_config = MulticastConfigBuilder::new()
        .retransmit_timeout(retransmit_ms)
        .build();
    let multicast = Arc::new(Multicast::new(&roster, &name, transport.clone(), multicast_config)?);

    let watcher = RuleWatcher::new(
        FileRuleSource::new(&config),
        Arc::clone(&book),
        transport_config.rule_poll_interval(),
    )
    .watch_liveness(transport.clone())
    .watch_liveness(multicast.clone())
    .spawn();

    header(&format!("NODE {} — listening on {}", name, transport.local_addr()));
    step(&format!("groups: {}", multicast.groups().join(", ")));
    step("type a line to multicast it, /help for commands");

    let printer = {
        let multicast = Arc::clone(&multicast);
        tokio::spawn(async move {
            while let Ok(message) = multicast.receive().await {
                show_delivery(&message);
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(3, ' ');
        match parts.next().unwrap_or_default() {
            "/quit" | "/q" => break,

            "/help" | "/h" => {
                println!("  <text>               multicast to every group");
                println!("  /g <group> <text>    multicast to one group");
                println!("  /stats [group]       show group state");
                println!("  /json                group state as JSON");
                println!("  /quit");
            }

            "/g" => match (parts.next(), parts.next()) {
                (Some(group), Some(text)) => {
                    if let Err(e) = multicast.send_to(group, text) {
                        fail(e);
                    }
                }
                _ => fail("usage: /g <group> <text>"),
            },

            "/stats" => {
                let wanted: Vec<String> = match parts.next() {
                    Some(group) => vec![group.to_string()],
                    None => multicast.groups().iter().map(|g| g.to_string()).collect(),
                };
                for group in wanted {
                    match multicast.stats(&group) {
                        Ok(stats) => show_stats(&stats),
                        Err(e) => fail(e),
                    }
                }
            }

            "/json" => {
                let stats: Vec<GroupStats> = multicast
                    .groups()
                    .iter()
                    .filter_map(|g| multicast.stats(g).ok())
                    .collect();
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }

            _ => {
                if let Err(e) = multicast.send(line) {
                    fail(e);
                }
            }
        }
    }

    multicast.shutdown();
    watcher.abort();
    transport.shutdown();
    let _ = printer.await;
    println!("  {}", "Goodbye!".dimmed());
    Ok(())
}

// ─── Demo ──────────────────────────────────────────────────────────────────

const DEMO_ROSTER: &str = r#"{
    "configuration": [
        {"name": "A", "ip": "127.0.0.1", "port": 12344},
        {"name": "B", "ip": "127.0.0.1", "port": 12345},
        {"name": "C", "ip": "127.0.0.1", "port": 12346}
    ],
    "groups": [{"name": "G", "members": ["A", "B", "C"]}]
}"#;

async fn next_delivery(node: &Multicast) -> AnyResult<WireMessage> {
    match tokio::time::timeout(Duration::from_secs(5), node.receive()).await {
        Ok(Ok(message)) => Ok(message),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err("timed out waiting for a delivery".into()),
    }
}

async fn run_demo() -> AnyResult<()> {
    header("DEMO — Causal Hold-Back and Retransmission");

    section("Setup: group G = {A, B, C}, A's first data message to C is delayed");
    let roster = Roster::from_json_str(DEMO_ROSTER)?;
    let book = RuleBook::new(
        RuleSet::new(vec![FaultRule::delay()
            .from_source("A")
            .to_destination("C")
            .of_kind(MessageKind::Data)
            .limited_to(1)]),
        RuleSet::empty(),
    );
    let config = MulticastConfigBuilder::new()
        .retransmit_timeout(500)
        .sweep_interval(50)
        .build();
    let mut nodes = Vec::new();
    for transport in create_network(&["A", "B", "C"], &book, ClockKind::Vector) {
        let name = transport.local_name().to_string();
        nodes.push(Multicast::new(&roster, name, transport, config.clone())?);
    }
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    step("rule: delay src=A dest=C kind=data limit=1");

    section("Phase 1: A multicasts m1; B delivers it and replies with m2");
    a.send_to("G", "m1")?;
    step("A: send m1");
    show_delivery(&next_delivery(b).await?);
    b.send_to("G", "m2")?;
    step("B: send m2 (depends on m1)");

    section("Phase 2: C has m2 but not m1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    show_stats(&c.stats("G")?);

    section("Phase 3: A retransmits m1 to C, releasing m2");
    for _ in 0..2 {
        show_delivery(&next_delivery(c).await?);
    }
    show_stats(&c.stats("G")?);
    show_stats(&a.stats("G")?);

    println!(
        "\n  {} {}",
        "✓".bright_green().bold(),
        "C delivered m1 before m2".bright_green().bold()
    );
    for node in &nodes {
        node.shutdown();
    }
    Ok(())
}

// ─── Entry point ───────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    setup_log();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            name,
            clock,
            retransmit_ms,
        } => run_node(config, name, clock.into(), retransmit_ms).await,
        Commands::Check { config } => run_check(&config),
        Commands::Demo => run_demo().await,
    };

    if let Err(e) = result {
        fail(e);
        std::process::exit(1);
    }
}
