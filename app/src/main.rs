mod logging;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sqlpane_adapters::secrets::KeyringOverlay;
use sqlpane_adapters::ssh::RusshTunnelConnector;
use sqlpane_adapters::{create_driver, UnsupportedDriver};
use sqlpane_core::config::{
    keys, ConfigSource, ConnectionConfig, FileProfilesStore, ProfileGroup, ProfilesError,
};
use sqlpane_core::connection::ConnectionError;
use sqlpane_core::driver::{QueryOutcome, Statement};
use sqlpane_core::events::HostKeyPrompt;
use sqlpane_core::notify::Notifier;
use sqlpane_core::statement::{split_statements, statement_at};
use sqlpane_core::{
    ConnectionEvent, ConnectionManager, ContentModelError, EventStream, QueryError,
    TableContentModel,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Parser)]
#[command(name = "sqlpane", version, about = "Run SQL and browse tables over direct or SSH-tunneled connections")]
struct Cli {
    /// Profiles file; defaults to the platform config directory.
    #[arg(long, global = true, env = "SQLPANE_PROFILES")]
    profiles: Option<PathBuf>,

    /// Log filter directives, e.g. `debug` or `sqlpane_core=trace`.
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage saved connection profiles.
    #[command(subcommand)]
    Profiles(ProfilesCommand),
    /// Execute statements from a SQL file.
    Run {
        #[arg(short, long)]
        profile: String,
        file: PathBuf,
        /// Run only the statement under this 1-based line; default runs all.
        #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
        line: Option<u32>,
    },
    /// Print one page of a table.
    Browse {
        #[arg(short, long)]
        profile: String,
        table: String,
        #[arg(long, default_value_t = 100)]
        page_size: u64,
        /// Zero-based page number.
        #[arg(long, default_value_t = 0)]
        page: u64,
        /// Equality filter written as `column=value`.
        #[arg(long)]
        filter: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum ProfilesCommand {
    List,
    /// Create or update a profile from `key=value` pairs.
    Set {
        name: String,
        #[arg(required = true)]
        assignments: Vec<String>,
    },
    Delete {
        name: String,
    },
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Profiles(#[from] ProfilesError),
    #[error("profile `{0}` not found")]
    UnknownProfile(String),
    #[error("expected `key=value`, got `{0}`")]
    InvalidAssignment(String),
    #[error(transparent)]
    Driver(#[from] UnsupportedDriver),
    #[error(transparent)]
    Start(#[from] ConnectionError),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Content(#[from] ContentModelError),
    #[error("failed to read {path}: {source}")]
    ReadSql {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no statement at line {0}")]
    NoStatement(u32),
}

/// Treats the terminal as the application window.
struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn app_has_focus(&self) -> bool {
        std::io::stderr().is_terminal()
    }

    fn notify(&self, title: &str, body: &str) {
        tracing::info!(target: "sqlpane::notify", "{title}: {body}");
    }
}

struct Session {
    manager: ConnectionManager,
    pump: JoinHandle<()>,
}

impl Session {
    async fn close(mut self) {
        self.manager.cleanup().await;
        drop(self.manager);
        if let Err(error) = self.pump.await {
            tracing::warn!(%error, "event pump ended abnormally");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(cli.log.as_deref());

    let mut store = match &cli.profiles {
        Some(path) => FileProfilesStore::load_from_path(path)?,
        None => FileProfilesStore::load_default()?,
    };

    match cli.command {
        Command::Profiles(command) => manage_profiles(&mut store, command)?,
        Command::Run {
            profile,
            file,
            line,
        } => {
            let statements = statements_from_file(&file, line)?;
            let session = connect(&store, &profile).await?;
            let result = run_statements(&session.manager, statements).await;
            session.close().await;
            result?;
        }
        Command::Browse {
            profile,
            table,
            page_size,
            page,
            filter,
        } => {
            let session = connect(&store, &profile).await?;
            let result = browse(&session.manager, &table, page_size, page, filter.as_deref()).await;
            session.close().await;
            print!("{}", result?);
        }
    }
    Ok(())
}

fn manage_profiles(store: &mut FileProfilesStore, command: ProfilesCommand) -> Result<(), AppError> {
    match command {
        ProfilesCommand::List => {
            for name in store.names() {
                let Some(group) = store.profile(name) else {
                    continue;
                };
                let config = ConnectionConfig::from_source(group);
                let via = config
                    .ssh
                    .as_ref()
                    .map(|ssh| format!(" via {}@{}:{}", ssh.username, ssh.host, ssh.port))
                    .unwrap_or_default();
                println!(
                    "{name}\t{}\t{}@{}:{}{via}",
                    config.driver_name, config.username, config.host, config.port
                );
            }
        }
        ProfilesCommand::Set { name, assignments } => {
            let mut group = store.profile(&name).cloned().unwrap_or_default();
            let secrets = KeyringOverlay::new(ProfileGroup::new(), name.as_str());
            for assignment in &assignments {
                let (key, value) = parse_assignment(assignment)?;
                if (key == keys::PASSWORD || key == keys::SSH_PASSWORD) && secrets.store(key, value) {
                    group.remove(key);
                    continue;
                }
                group.set(key, value);
            }
            store.upsert_profile(name.as_str(), group);
            store.persist()?;
            tracing::info!(profile = %name, path = %store.path().display(), "profile saved");
        }
        ProfilesCommand::Delete { name } => {
            if !store.delete_profile(&name) {
                return Err(AppError::UnknownProfile(name));
            }
            store.persist()?;
        }
    }
    Ok(())
}

fn parse_assignment(raw: &str) -> Result<(&str, &str), AppError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value)),
        _ => Err(AppError::InvalidAssignment(raw.to_string())),
    }
}

fn load_config(source: &impl ConfigSource) -> ConnectionConfig {
    resolve_config(
        source,
        std::env::var("SQLPANE_DB_PASSWORD").ok().filter(|pw| !pw.is_empty()),
    )
}

/// `env_password` only applies when neither the profile nor the keyring has one.
fn resolve_config(source: &impl ConfigSource, env_password: Option<String>) -> ConnectionConfig {
    let mut config = ConnectionConfig::from_source(source);
    if config.password.is_empty() {
        if let Some(password) = env_password {
            config.password = password;
        }
    }
    config
}

fn statements_from_file(path: &Path, line: Option<u32>) -> Result<Vec<String>, AppError> {
    let text = std::fs::read_to_string(path).map_err(|source| AppError::ReadSql {
        path: path.to_path_buf(),
        source,
    })?;
    select_statements(&text, line)
}

fn select_statements(text: &str, line: Option<u32>) -> Result<Vec<String>, AppError> {
    match line {
        Some(line) => {
            let statement = statement_at(text, line.saturating_sub(1) as usize);
            if statement.is_empty() {
                return Err(AppError::NoStatement(line));
            }
            Ok(vec![statement])
        }
        None => Ok(split_statements(text)),
    }
}

async fn connect(store: &FileProfilesStore, profile: &str) -> Result<Session, AppError> {
    let group = store
        .profile(profile)
        .ok_or_else(|| AppError::UnknownProfile(profile.to_string()))?;
    let config = load_config(&KeyringOverlay::new(group, profile));
    let driver = create_driver(&config.driver_name)?;

    let (manager, events) = ConnectionManager::builder(config, driver)
        .tunnel_connector(Arc::new(RusshTunnelConnector::new()))
        .notifier(Arc::new(TerminalNotifier))
        .build();
    let (ready_tx, ready) = oneshot::channel();
    let pump = tokio::spawn(pump_events(events, ready_tx));
    let session = Session { manager, pump };

    if let Err(error) = session.manager.start() {
        session.close().await;
        return Err(error.into());
    }
    match ready.await {
        Ok(Ok(())) => Ok(session),
        Ok(Err(message)) => {
            session.close().await;
            Err(AppError::Connect(message))
        }
        Err(_) => {
            session.close().await;
            Err(AppError::Connect("connection closed before reporting".to_string()))
        }
    }
}

async fn pump_events(mut events: EventStream, ready: oneshot::Sender<Result<(), String>>) {
    let mut ready = Some(ready);
    while let Some(event) = events.next().await {
        match event {
            ConnectionEvent::ConnectionSuccess => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            ConnectionEvent::ConnectionFailed(message) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(message));
                }
            }
            ConnectionEvent::ConfirmUnknownHost(prompt) => answer_host_prompt(prompt).await,
            ConnectionEvent::DatabaseChanged(name) => tracing::info!(database = %name, "database changed"),
            ConnectionEvent::QueryExecuted { statement, status } => {
                tracing::info!(%status, "{statement}");
            }
            ConnectionEvent::PagesChanged {
                offset,
                page_size,
                total,
            } => tracing::debug!(offset, page_size, total, "page loaded"),
        }
    }
}

async fn answer_host_prompt(prompt: HostKeyPrompt) {
    let message = format!(
        "The authenticity of host {} can't be established. Key fingerprint is {}. Trust it?",
        prompt.host(),
        prompt.fingerprint()
    );
    let accepted = tokio::task::spawn_blocking(move || {
        inquire::Confirm::new(&message)
            .with_default(false)
            .prompt()
            .unwrap_or_else(|error| {
                tracing::warn!(%error, "host key prompt failed; rejecting");
                false
            })
    })
    .await
    .unwrap_or(false);
    prompt.answer(accepted);
}

async fn run_statements(manager: &ConnectionManager, statements: Vec<String>) -> Result<(), AppError> {
    for sql in statements {
        let executed = manager.exec_query(Statement::new(sql)).await?;
        if executed.outcome.is_select() {
            print!("{}", format_outcome(&executed.outcome));
        }
    }
    Ok(())
}

async fn browse(
    manager: &ConnectionManager,
    table: &str,
    page_size: u64,
    page: u64,
    filter: Option<&str>,
) -> Result<String, AppError> {
    let mut model = TableContentModel::describe(manager, table, page_size).await?;
    if let Some(filter) = filter {
        let (column, value) = parse_assignment(filter)?;
        model.set_filter(column, "=", value)?;
    }
    model.seek_page(page).await?;

    let mut rendered = model
        .columns()
        .iter()
        .map(|column| column.name.as_str())
        .collect::<Vec<_>>()
        .join("\t");
    rendered.push('\n');
    for row in 0..model.row_count() {
        let cells = (0..model.column_count())
            .map(|column| model.cell_value(row, column).unwrap_or("NULL"))
            .collect::<Vec<_>>();
        rendered.push_str(&cells.join("\t"));
        rendered.push('\n');
    }
    let shown = model.row_count() as u64;
    let first = if shown == 0 { 0 } else { model.row_offset() + 1 };
    rendered.push_str(&format!(
        "-- rows {first}-{} of {}{}\n",
        model.row_offset() + shown,
        model.total_rows(),
        if model.is_editable() { "" } else { " (read-only)" }
    ));
    Ok(rendered)
}

fn format_outcome(outcome: &QueryOutcome) -> String {
    let mut rendered = outcome.columns.join("\t");
    rendered.push('\n');
    for row in &outcome.rows {
        let cells = row
            .values
            .iter()
            .map(|value| value.as_deref().unwrap_or("NULL"))
            .collect::<Vec<_>>();
        rendered.push_str(&cells.join("\t"));
        rendered.push('\n');
    }
    rendered
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use sqlpane_core::config::{keys, FileProfilesStore, SshAuth};
    use sqlpane_core::driver::{QueryOutcome, QueryRow};
    use tempfile::TempDir;

    use super::{
        format_outcome, manage_profiles, parse_assignment, resolve_config, select_statements,
        AppError, Cli, Command, ProfilesCommand,
    };

    #[test]
    fn run_command_parses_line_and_rejects_zero() {
        let cli = Cli::try_parse_from([
            "sqlpane", "run", "--profile", "local", "queries.sql", "--line", "3",
        ])
        .expect("run should parse");
        assert!(matches!(
            cli.command,
            Command::Run { line: Some(3), ref profile, .. } if profile == "local"
        ));

        assert!(Cli::try_parse_from(["sqlpane", "run", "-p", "local", "q.sql", "--line", "0"]).is_err());
    }

    #[test]
    fn browse_defaults_to_first_hundred_rows() {
        let cli = Cli::try_parse_from(["sqlpane", "browse", "-p", "local", "orders"])
            .expect("browse should parse");
        match cli.command {
            Command::Browse {
                page_size,
                page,
                filter,
                ..
            } => {
                assert_eq!(page_size, 100);
                assert_eq!(page, 0);
                assert!(filter.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn line_selection_uses_one_based_lines() {
        let text = "SELECT 1;\nSELECT 2;\n";
        assert_eq!(
            select_statements(text, Some(2)).expect("statement on line 2"),
            vec!["SELECT 2;".to_string()]
        );
        assert_eq!(select_statements(text, None).expect("all statements").len(), 2);
        assert!(matches!(
            select_statements(text, Some(9)),
            Err(AppError::NoStatement(9))
        ));
    }

    #[test]
    fn assignments_need_a_key() {
        assert_eq!(parse_assignment("host=db").expect("valid"), ("host", "db"));
        assert_eq!(parse_assignment("filter=a=b").expect("valid"), ("filter", "a=b"));
        assert!(parse_assignment("=db").is_err());
        assert!(parse_assignment("host").is_err());
    }

    #[test]
    fn profiles_set_and_delete_round_trip() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("profiles.toml");
        let mut store = FileProfilesStore::load_from_path(&path).expect("load store");

        manage_profiles(
            &mut store,
            ProfilesCommand::Set {
                name: "staging".to_string(),
                assignments: vec![
                    "host=db.internal".to_string(),
                    "driverName=mysql".to_string(),
                    "useSshTunnel=true".to_string(),
                    "sshHost=bastion".to_string(),
                    "sshKeyPath=/keys/id_ed25519".to_string(),
                ],
            },
        )
        .expect("set profile");

        let reloaded = FileProfilesStore::load_from_path(&path).expect("reload store");
        let config = resolve_config(reloaded.profile("staging").expect("saved profile"), None);
        assert_eq!(config.host, "db.internal");
        let ssh = config.ssh.expect("tunnel configured");
        assert_eq!(ssh.port, 22);
        assert_eq!(ssh.auth, SshAuth::Key("/keys/id_ed25519".into()));

        manage_profiles(
            &mut store,
            ProfilesCommand::Delete {
                name: "staging".to_string(),
            },
        )
        .expect("delete profile");
        assert!(matches!(
            manage_profiles(
                &mut store,
                ProfilesCommand::Delete {
                    name: "staging".to_string()
                }
            ),
            Err(AppError::UnknownProfile(_))
        ));
    }

    #[test]
    fn env_password_only_fills_gaps() {
        let explicit = std::collections::BTreeMap::from([
            (keys::HOST.to_string(), "db".to_string()),
            (keys::PASSWORD.to_string(), "from-profile".to_string()),
        ]);
        assert_eq!(
            resolve_config(&explicit, Some("from-env".to_string())).password,
            "from-profile"
        );

        let bare = std::collections::BTreeMap::from([(keys::HOST.to_string(), "db".to_string())]);
        assert_eq!(
            resolve_config(&bare, Some("from-env".to_string())).password,
            "from-env"
        );
    }

    #[test]
    fn outcome_renders_as_tab_separated_rows() {
        let outcome = QueryOutcome {
            columns: vec!["id".to_string(), "note".to_string()],
            rows: vec![
                QueryRow::new(vec![Some("1".to_string()), None]),
                QueryRow::new(vec![Some("2".to_string()), Some("ok".to_string())]),
            ],
            ..QueryOutcome::default()
        };
        assert_eq!(format_outcome(&outcome), "id\tnote\n1\tNULL\n2\tok\n");
    }
}
