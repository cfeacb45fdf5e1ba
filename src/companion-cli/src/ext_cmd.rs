//! Extension management command for Companion CLI.
//!
//! Provides extension management functionality:
//! - List installed extensions and show one
//! - Install from a directory, import and export zip archives
//! - Enable, disable and uninstall extensions
//! - Read and clear extension logs
//! - Reload extensions and deliver a hook by hand

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;

use companion_extensions::{
    ExtensionManager, ExtensionState, HookEvent, JsonFileSettings, LoadReport, LogEntry,
    RuntimeConfig,
};

/// Settings file kept in the base directory.
const SETTINGS_FILE: &str = "settings.json";

/// Where the runtime lives, from the global flags.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    pub base_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

impl RuntimeOptions {
    /// Resolve the runtime configuration.
    ///
    /// `--base-dir` overrides the base directory from `--config`.
    pub fn runtime_config(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => RuntimeConfig::default(),
        };
        if let Some(base_dir) = &self.base_dir {
            config.base_dir = base_dir.clone();
        }
        Ok(config)
    }

    /// Build a manager over the resolved configuration.
    pub fn manager(&self) -> Result<ExtensionManager> {
        let config = self.runtime_config()?;
        let settings = Arc::new(JsonFileSettings::new(config.base_dir.join(SETTINGS_FILE)));
        tracing::debug!(
            "Extension root {:?}, settings {:?}",
            config.extension_root(),
            settings.path()
        );
        Ok(ExtensionManager::new(config, settings)?)
    }
}

/// Extension CLI command.
#[derive(Debug, Parser)]
pub struct ExtensionCli {
    #[command(subcommand)]
    pub subcommand: ExtensionSubcommand,
}

/// Extension subcommands.
#[derive(Debug, clap::Subcommand)]
pub enum ExtensionSubcommand {
    /// List installed extensions
    #[command(visible_alias = "ls")]
    List(ListArgs),

    /// Show extension information
    #[command(visible_alias = "info")]
    Show(ShowArgs),

    /// Enable an extension
    Enable(IdArgs),

    /// Disable an extension
    Disable(IdArgs),

    /// Install an extension from a directory
    #[command(visible_alias = "add")]
    Install(InstallArgs),

    /// Import extensions from a zip archive
    Import(ImportArgs),

    /// Export an extension to a zip archive
    Export(ExportArgs),

    /// Remove an installed extension
    #[command(visible_alias = "rm")]
    Uninstall(UninstallArgs),

    /// Show recent log entries of an extension
    Logs(LogsArgs),

    /// Clear extension logs
    ClearLogs(ClearLogsArgs),

    /// Reload all extensions, or one
    Reload(ReloadArgs),

    /// Load extensions and deliver one hook to them
    Dispatch(DispatchArgs),
}

/// Arguments for list command.
#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show only enabled extensions
    #[arg(long, conflicts_with = "disabled")]
    pub enabled: bool,

    /// Show only disabled extensions
    #[arg(long)]
    pub disabled: bool,
}

/// Arguments for show command.
#[derive(Debug, Parser)]
pub struct ShowArgs {
    /// Extension id
    pub id: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments taking one extension id.
#[derive(Debug, Parser)]
pub struct IdArgs {
    /// Extension id
    pub id: String,
}

/// Arguments for install command.
#[derive(Debug, Parser)]
pub struct InstallArgs {
    /// Package directory (must contain extension.json)
    pub path: PathBuf,
}

/// Arguments for import command.
#[derive(Debug, Parser)]
pub struct ImportArgs {
    /// Zip archive to import
    pub archive: PathBuf,
}

/// Arguments for export command.
#[derive(Debug, Parser)]
pub struct ExportArgs {
    /// Extension id
    pub id: String,

    /// Output archive (defaults to `<id>.zip`)
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

/// Arguments for uninstall command.
#[derive(Debug, Parser)]
pub struct UninstallArgs {
    /// Extension id
    pub id: String,

    /// Skip confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,
}

/// Arguments for logs command.
#[derive(Debug, Parser)]
pub struct LogsArgs {
    /// Extension id
    pub id: String,

    /// Number of entries to show
    #[arg(long, short = 'n', default_value_t = 200)]
    pub limit: usize,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for clear-logs command.
#[derive(Debug, Parser)]
pub struct ClearLogsArgs {
    /// Extension id (all extensions when omitted)
    pub id: Option<String>,
}

/// Arguments for reload command.
#[derive(Debug, Parser)]
pub struct ReloadArgs {
    /// Extension id (all extensions when omitted)
    pub id: Option<String>,
}

/// Arguments for dispatch command.
#[derive(Debug, Parser)]
pub struct DispatchArgs {
    /// Hook name (e.g. on_app_start, on_user_message)
    pub hook: String,

    /// Hook payload as JSON; plain text is sent as a string
    #[arg(long, short = 'p')]
    pub payload: Option<String>,

    /// Print the AI context collected for this text afterwards
    #[arg(long)]
    pub ai_context: Option<String>,
}

impl ExtensionCli {
    /// Run the extension command.
    pub fn run(self, options: &RuntimeOptions) -> Result<()> {
        let manager = options.manager()?;
        let result = match self.subcommand {
            ExtensionSubcommand::List(args) => run_list(&manager, args),
            ExtensionSubcommand::Show(args) => run_show(&manager, args),
            ExtensionSubcommand::Enable(args) => run_set_enabled(&manager, &args.id, true),
            ExtensionSubcommand::Disable(args) => run_set_enabled(&manager, &args.id, false),
            ExtensionSubcommand::Install(args) => run_install(&manager, args),
            ExtensionSubcommand::Import(args) => run_import(&manager, args),
            ExtensionSubcommand::Export(args) => run_export(&manager, args),
            ExtensionSubcommand::Uninstall(args) => run_uninstall(&manager, args),
            ExtensionSubcommand::Logs(args) => run_logs(&manager, args),
            ExtensionSubcommand::ClearLogs(args) => run_clear_logs(&manager, args),
            ExtensionSubcommand::Reload(args) => run_reload(&manager, args),
            ExtensionSubcommand::Dispatch(args) => run_dispatch(&manager, args),
        };
        manager.shutdown();
        result
    }
}

/// One log entry for display.
#[derive(Debug, Serialize)]
struct LogLine {
    timestamp: String,
    level: String,
    message: String,
}

impl From<LogEntry> for LogLine {
    fn from(entry: LogEntry) -> Self {
        Self {
            timestamp: entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            level: entry.level.to_string(),
            message: entry.message,
        }
    }
}

/// Short status for list output.
fn status_label(state: &ExtensionState) -> String {
    if !state.enabled {
        "disabled".to_string()
    } else if state.loaded {
        "loaded".to_string()
    } else if state.error.is_empty() {
        "not loaded".to_string()
    } else {
        format!("error: {}", state.error)
    }
}

fn find_state(manager: &ExtensionManager, id: &str) -> Result<ExtensionState> {
    match manager.export_state().into_iter().find(|s| s.id == id) {
        Some(state) => Ok(state),
        None => bail!("Extension '{}' is not installed.", id),
    }
}

fn print_report(report: &LoadReport) {
    for (id, error) in &report.failed {
        println!("  {id}: failed to load: {error}");
    }
    for invalid in &report.invalid {
        println!(
            "  skipped {}: {}",
            invalid.manifest_path.display(),
            invalid.error
        );
    }
}

fn run_list(manager: &ExtensionManager, args: ListArgs) -> Result<()> {
    manager.load_all();
    let states: Vec<ExtensionState> = manager
        .export_state()
        .into_iter()
        .filter(|s| !args.enabled || s.enabled)
        .filter(|s| !args.disabled || !s.enabled)
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&states)?);
        return Ok(());
    }

    if states.is_empty() {
        println!("No extensions installed.");
        println!("\nExtension directory: {}", manager.extension_root().display());
        println!("Use 'companion ext install <dir>' to install an extension.");
        return Ok(());
    }

    println!("{:<24} {:<10} STATUS", "ID", "VERSION");
    println!("{}", "-".repeat(60));
    for state in &states {
        println!(
            "{:<24} {:<10} {}",
            state.id,
            state.version,
            status_label(state)
        );
    }
    Ok(())
}

fn run_show(manager: &ExtensionManager, args: ShowArgs) -> Result<()> {
    manager.load_all();
    let state = find_state(manager, &args.id)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!("Extension: {}", state.id);
    println!("{}", "-".repeat(40));
    println!("  Name:        {}", state.name);
    println!("  Version:     {}", state.version);
    if !state.description.is_empty() {
        println!("  Description: {}", state.description);
    }
    println!("  Runtime:     {}", state.runtime);
    println!("  Enabled:     {}", state.enabled);
    println!("  Loaded:      {}", state.loaded);
    if let Some(resolution) = state.resolution {
        println!("  Resolution:  {resolution}");
    }
    if !state.error.is_empty() {
        println!("  Error:       {}", state.error);
    }
    println!("  Path:        {}", state.path.display());
    Ok(())
}

fn run_set_enabled(manager: &ExtensionManager, id: &str, enabled: bool) -> Result<()> {
    manager.load_all();
    find_state(manager, id)?;
    manager.set_enabled(id, enabled)?;

    if enabled {
        let state = find_state(manager, id)?;
        if !state.loaded {
            println!("Extension '{id}' enabled but failed to load: {}", state.error);
            return Ok(());
        }
        println!("Extension '{id}' enabled.");
    } else {
        println!("Extension '{id}' disabled.");
    }
    Ok(())
}

fn run_install(manager: &ExtensionManager, args: InstallArgs) -> Result<()> {
    let outcome = manager
        .install_from_directory(&args.path)
        .with_context(|| format!("Failed to install {}", args.path.display()))?;
    for (id, path) in outcome.installed.iter().zip(&outcome.paths) {
        println!("Installed '{id}' to {}", path.display());
    }
    print_report(&outcome.report);
    Ok(())
}

fn run_import(manager: &ExtensionManager, args: ImportArgs) -> Result<()> {
    let outcome = manager
        .import_from_archive(&args.archive)
        .with_context(|| format!("Failed to import {}", args.archive.display()))?;
    for (id, path) in outcome.installed.iter().zip(&outcome.paths) {
        println!("Imported '{id}' to {}", path.display());
    }
    print_report(&outcome.report);
    Ok(())
}

fn default_export_path(id: &str) -> PathBuf {
    PathBuf::from(format!("{id}.zip"))
}

fn run_export(manager: &ExtensionManager, args: ExportArgs) -> Result<()> {
    manager.load_all();
    let output = args
        .output
        .unwrap_or_else(|| default_export_path(&args.id));
    let path = manager
        .export_to_archive(&args.id, &output)
        .with_context(|| format!("Failed to export '{}'", args.id))?;
    println!("Exported '{}' to {}", args.id, path.display());
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    println!("{prompt} (y/N)");
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn run_uninstall(manager: &ExtensionManager, args: UninstallArgs) -> Result<()> {
    manager.load_all();
    let state = find_state(manager, &args.id)?;

    if !args.yes
        && !confirm(&format!(
            "Are you sure you want to remove extension '{}' ({})?",
            args.id,
            state.path.display()
        ))?
    {
        println!("Aborted.");
        return Ok(());
    }

    manager.uninstall(&args.id)?;
    println!("Extension '{}' removed successfully.", args.id);
    Ok(())
}

fn run_logs(manager: &ExtensionManager, args: LogsArgs) -> Result<()> {
    let lines: Vec<LogLine> = manager
        .get_logs(&args.id, args.limit)
        .into_iter()
        .map(LogLine::from)
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&lines)?);
        return Ok(());
    }
    if lines.is_empty() {
        println!("No log entries for '{}'.", args.id);
        return Ok(());
    }
    for line in lines {
        println!("[{}] [{}] {}", line.timestamp, line.level, line.message);
    }
    Ok(())
}

fn run_clear_logs(manager: &ExtensionManager, args: ClearLogsArgs) -> Result<()> {
    manager.clear_logs(args.id.as_deref());
    match args.id {
        Some(id) => println!("Cleared logs of '{id}'."),
        None => println!("Cleared all extension logs."),
    }
    Ok(())
}

fn run_reload(manager: &ExtensionManager, args: ReloadArgs) -> Result<()> {
    match args.id {
        Some(id) => {
            manager.load_all();
            if manager.reload_one(&id)? {
                println!("Extension '{id}' reloaded.");
            } else {
                let state = find_state(manager, &id)?;
                println!("Extension '{id}' did not load: {}", status_label(&state));
            }
        }
        None => {
            let report = manager.reload_all();
            println!(
                "{} loaded, {} disabled, {} failed",
                report.loaded.len(),
                report.disabled.len(),
                report.failed.len()
            );
            print_report(&report);
        }
    }
    Ok(())
}

/// Parse a payload flag: JSON when it parses, a plain string otherwise.
fn parse_payload(raw: Option<&str>) -> Value {
    match raw {
        None => Value::Null,
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

fn run_dispatch(manager: &ExtensionManager, args: DispatchArgs) -> Result<()> {
    let payload = parse_payload(args.payload.as_deref());
    let Some(event) = HookEvent::from_parts(&args.hook, payload) else {
        bail!(
            "Unknown hook '{}'. Expected one of: {}",
            args.hook,
            HookEvent::NAMES.join(", ")
        );
    };

    manager.load_all();
    let report = manager.dispatch(&event);
    println!(
        "{}: delivered to {}, failed in {}",
        event.name(),
        report.delivered.len(),
        report.failed.len()
    );
    for id in &report.failed {
        println!("  {id}: see 'companion ext logs {id}'");
    }

    if let Some(text) = args.ai_context.as_deref() {
        for line in manager.collect_ai_context(text) {
            println!("{line}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::path::Path;
    use tempfile::TempDir;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: ExtensionSubcommand,
    }

    fn parse(args: &[&str]) -> ExtensionSubcommand {
        let mut argv = vec!["ext"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap().command
    }

    fn options(temp: &TempDir) -> RuntimeOptions {
        RuntimeOptions {
            base_dir: Some(temp.path().to_path_buf()),
            config: None,
        }
    }

    fn write_package(root: &Path, id: &str) -> PathBuf {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("extension.json"),
            format!(r#"{{ "id": "{id}", "version": "0.3.0", "runtime": "native" }}"#),
        )
        .unwrap();
        dir
    }

    fn state(id: &str, enabled: bool, loaded: bool, error: &str) -> ExtensionState {
        ExtensionState {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            enabled,
            loaded,
            error: error.to_string(),
            path: PathBuf::from("/ext").join(id),
            runtime: "process".to_string(),
            resolution: None,
        }
    }

    #[test]
    fn test_command_definition_is_valid() {
        TestCli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        assert!(matches!(parse(&["ls", "--json"]), ExtensionSubcommand::List(a) if a.json));
        assert!(matches!(
            parse(&["export", "weather", "-o", "/tmp/w.zip"]),
            ExtensionSubcommand::Export(a) if a.output == Some(PathBuf::from("/tmp/w.zip"))
        ));
        assert!(matches!(
            parse(&["logs", "weather"]),
            ExtensionSubcommand::Logs(a) if a.limit == 200
        ));
        assert!(matches!(
            parse(&["clear-logs"]),
            ExtensionSubcommand::ClearLogs(a) if a.id.is_none()
        ));
        assert!(matches!(
            parse(&["rm", "weather", "-y"]),
            ExtensionSubcommand::Uninstall(a) if a.yes
        ));
    }

    #[test]
    fn test_list_filters_conflict() {
        let err = TestCli::try_parse_from(["ext", "list", "--enabled", "--disabled"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_status_label() {
        assert_eq!(status_label(&state("a", false, false, "")), "disabled");
        assert_eq!(status_label(&state("a", true, true, "")), "loaded");
        assert_eq!(status_label(&state("a", true, false, "")), "not loaded");
        assert_eq!(
            status_label(&state("a", true, false, "entry not found")),
            "error: entry not found"
        );
    }

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload(None), Value::Null);
        assert_eq!(
            parse_payload(Some(r#"{"mood":"calm"}"#)),
            serde_json::json!({ "mood": "calm" })
        );
        assert_eq!(
            parse_payload(Some("good morning")),
            Value::String("good morning".to_string())
        );
    }

    #[test]
    fn test_default_export_path() {
        assert_eq!(default_export_path("weather"), PathBuf::from("weather.zip"));
    }

    #[test]
    fn test_config_file_and_base_dir_override() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("runtime.toml");
        std::fs::write(&config_path, "base_dir = \"/srv/pet\"\nlog_capacity = 10\n").unwrap();

        let opts = RuntimeOptions {
            base_dir: None,
            config: Some(config_path.clone()),
        };
        let config = opts.runtime_config().unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/srv/pet"));
        assert_eq!(config.log_capacity, 10);

        let opts = RuntimeOptions {
            base_dir: Some(temp.path().to_path_buf()),
            config: Some(config_path),
        };
        assert_eq!(opts.runtime_config().unwrap().base_dir, temp.path());
    }

    #[test]
    fn test_disable_persists_to_settings_file() {
        let temp = TempDir::new().unwrap();
        let opts = options(&temp);
        let manager = opts.manager().unwrap();
        write_package(&manager.extension_root(), "weather");

        run_set_enabled(&manager, "weather", false).unwrap();
        manager.shutdown();

        let settings: Value = serde_json::from_str(
            &std::fs::read_to_string(temp.path().join(SETTINGS_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(
            settings["extensions_enabled"],
            serde_json::json!({ "weather": false })
        );

        let manager = opts.manager().unwrap();
        manager.load_all();
        assert!(!find_state(&manager, "weather").unwrap().enabled);
    }

    #[test]
    fn test_unknown_extension_is_an_error() {
        let temp = TempDir::new().unwrap();
        let manager = options(&temp).manager().unwrap();
        let err = run_set_enabled(&manager, "ghost", true).unwrap_err();
        assert!(err.to_string().contains("'ghost' is not installed"));

        let err = run_show(
            &manager,
            ShowArgs {
                id: "ghost".to_string(),
                json: false,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }

    #[test]
    fn test_install_export_uninstall() {
        let temp = TempDir::new().unwrap();
        let manager = options(&temp).manager().unwrap();
        let source = TempDir::new().unwrap();
        let package = write_package(source.path(), "weather");

        run_install(
            &manager,
            InstallArgs {
                path: package.clone(),
            },
        )
        .unwrap();
        assert!(manager.extension_root().join("weather/extension.json").is_file());

        let archive = temp.path().join("out/weather.zip");
        run_export(
            &manager,
            ExportArgs {
                id: "weather".to_string(),
                output: Some(archive.clone()),
            },
        )
        .unwrap();
        assert!(archive.is_file());

        run_uninstall(
            &manager,
            UninstallArgs {
                id: "weather".to_string(),
                yes: true,
            },
        )
        .unwrap();
        assert!(!manager.extension_root().join("weather").exists());

        run_import(&manager, ImportArgs { archive }).unwrap();
        assert!(manager.extension_root().join("weather").is_dir());
    }

    #[test]
    fn test_dispatch_rejects_unknown_hook() {
        let temp = TempDir::new().unwrap();
        let manager = options(&temp).manager().unwrap();
        let err = run_dispatch(
            &manager,
            DispatchArgs {
                hook: "on_load".to_string(),
                payload: None,
                ai_context: None,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown hook 'on_load'"));
    }
}
