use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use todosync::core::{Body, ProjectId};
use todosync::format::{self, RenderContext};
use todosync::naming::{self, ProjectName};
use todosync::parser::{self, LineContext};
use todosync::reconcile::{DiffOptions, Reconciler};
use todosync::state::{EditorSettings, Settings, SortPolicy};
use todosync::storage::{FsDocumentStore, JsonStateStore, StateStore};
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "todosync",
    about = "Offline tooling for synced task documents",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse task documents and print their bodies.
    Parse(ParseArgs),

    /// Re-render task documents, leaving non-task text untouched.
    Format(FormatArgs),

    /// Split project document names into name and id.
    ParseName(ParseNameArgs),

    /// Build the document name of a project.
    FileName(FileNameArgs),

    /// Dry-run a push against a persisted snapshot and print the command batch.
    Diff(DiffArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Markdown files or directories containing them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
    /// Date relative due expressions resolve against. Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Markdown files or directories to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
    /// Sort policy; overrides the settings file.
    #[arg(long, value_enum)]
    sort: Option<SortArg>,
    /// Move every task above the surrounding text.
    #[arg(long)]
    todos_on_top: bool,
    /// Drop color markup from the output.
    #[arg(long)]
    plain: bool,
    /// Settings JSON file.
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Date used for relative due labels. Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SortArg {
    None,
    Priority,
    DueAscending,
    DueDescending,
}

impl From<SortArg> for SortPolicy {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::None => SortPolicy::None,
            SortArg::Priority => SortPolicy::Priority,
            SortArg::DueAscending => SortPolicy::DueAscending,
            SortArg::DueDescending => SortPolicy::DueDescending,
        }
    }
}

#[derive(Debug, Args)]
struct ParseNameArgs {
    #[arg(required = true)]
    names: Vec<String>,
}

#[derive(Debug, Args)]
struct FileNameArgs {
    name: String,
    /// Remote project id.
    #[arg(long)]
    id: Option<String>,
    #[arg(long, default_value = "md")]
    extension: String,
}

#[derive(Debug, Args)]
struct DiffArgs {
    /// Vault root the managed directory and registered documents are relative to.
    #[arg(long)]
    vault: PathBuf,
    /// Persisted sync state JSON.
    #[arg(long)]
    state: PathBuf,
    /// Settings JSON file.
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    todosync::logging::init(cli.verbose);
    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Format(args) => handle_format(args),
        Commands::ParseName(args) => handle_parse_name(args),
        Commands::FileName(args) => handle_file_name(args),
        Commands::Diff(args) => handle_diff(args).await,
    }
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { inputs, json, date } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no markdown files found in the provided inputs");
    }

    let today = date.unwrap_or_else(|| Local::now().date_naive());
    let mut parsed = Vec::new();
    for path in expanded {
        debug!(path = %path.display(), "parsing");
        let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        parsed.push((path, parse_document(&text, today)));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            body: &'a Body,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, body)| JsonOutput {
                path: path.display().to_string(),
                body,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, body)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", body);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_format(args: FormatArgs) -> Result<()> {
    let FormatArgs {
        inputs,
        in_place,
        sort,
        todos_on_top,
        plain,
        settings,
        date,
    } = args;
    let settings = load_settings(settings.as_deref())?;
    let editor = editor_settings(settings.editor, sort, todos_on_top, plain);
    let today = date.unwrap_or_else(|| Local::now().date_naive());

    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no markdown files found in the provided inputs");
    }

    let mut first = true;
    for path in expanded {
        debug!(path = %path.display(), "formatting");
        let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        let formatted = format_document(&text, &editor, today);

        if in_place {
            fs::write(&path, formatted.as_bytes())
                .with_context(|| format!("writing {:?}", path))?;
        } else {
            if !first {
                println!();
                println!("== {} ==", path.display());
            } else if inputs.len() > 1 {
                println!("== {} ==", path.display());
            }
            first = false;
            print!("{formatted}");
        }
    }

    Ok(())
}

fn handle_parse_name(args: ParseNameArgs) -> Result<()> {
    for name in &args.names {
        println!("{}", serde_json::to_string(&naming::from_file_name(name))?);
    }
    Ok(())
}

fn handle_file_name(args: FileNameArgs) -> Result<()> {
    let project = ProjectName {
        name: args.name,
        id: args.id.map(ProjectId),
    };
    println!("{}", naming::to_file_name(&project, &args.extension));
    Ok(())
}

async fn handle_diff(args: DiffArgs) -> Result<()> {
    let settings = load_settings(args.settings.as_deref())?;
    let store = JsonStateStore::new(&args.state);
    let mut state = store
        .load()
        .with_context(|| format!("loading state {:?}", args.state))?;
    if !state.snapshot.is_pulled() {
        anyhow::bail!("{:?} holds no remote snapshot; pull before diffing", args.state);
    }

    let docs = FsDocumentStore::new(&args.vault);
    let today = Local::now().date_naive();
    let outcome = Reconciler::new(&mut state, &settings, today, DiffOptions::PUSH)
        .run(&docs)
        .await
        .with_context(|| format!("scanning vault {:?}", args.vault))?;

    for warning in &outcome.warnings {
        warn!("{warning}");
    }
    info!(
        commands = outcome.commands.len(),
        dirty = outcome.dirty_projects().count(),
        "dry run complete, nothing written"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(outcome.commands.as_slice())?
    );
    Ok(())
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => {
            Settings::load(path).with_context(|| format!("loading settings {:?}", path))
        }
        None => Ok(Settings::default()),
    }
}

fn editor_settings(
    mut editor: EditorSettings,
    sort: Option<SortArg>,
    todos_on_top: bool,
    plain: bool,
) -> EditorSettings {
    if let Some(sort) = sort {
        editor.sort = sort.into();
    }
    editor.todos_on_top |= todos_on_top;
    if plain {
        editor.show_task_color = false;
        editor.show_due_color = false;
    }
    editor
}

fn parse_document(text: &str, today: NaiveDate) -> Body {
    parser::segment(&parser::split_lines(text), &LineContext::new(today))
}

/// Rendered document with a single trailing newline.
fn format_document(text: &str, editor: &EditorSettings, today: NaiveDate) -> String {
    let body = parse_document(text, today);
    let mut out = format::format_body(&body, &RenderContext::new(editor, today));
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn is_markdown(path: &Path) -> bool {
    path.extension().map(|ext| ext == "md").unwrap_or(false)
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = %canonical.display(), "scanning directory");
            let mut found = Vec::new();
            visit_dir(&canonical, &mut found, &mut HashSet::new())?;
            found.sort();
            for file in found {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_markdown(&canonical) {
                anyhow::bail!("{:?} is not a .md file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_markdown(&canonical) {
        debug!(file = %canonical.display(), "found document");
        out.push(canonical);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 13).expect("date")
    }

    #[test]
    fn expand_inputs_collects_markdown_recursively() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join("todos/archive")).expect("mkdir");
        fs::write(root.join("todos/Home - 1.md"), "- [ ] a").expect("write");
        fs::write(root.join("todos/archive/Old.md"), "- [ ] b").expect("write");
        fs::write(root.join("todos/notes.txt"), "skip").expect("write");

        let found = expand_inputs(&[root.join("todos")]).expect("expand");
        let names: Vec<_> = found
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["Home - 1.md", "Old.md"]);
    }

    #[test]
    fn expand_inputs_rejects_other_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("notes.txt");
        fs::write(&file, "x").expect("write");
        assert!(expand_inputs(&[file]).is_err());
    }

    #[test]
    fn editor_flags_override_settings() {
        let editor = editor_settings(
            EditorSettings::default(),
            Some(SortArg::DueAscending),
            true,
            true,
        );
        assert_eq!(editor.sort, SortPolicy::DueAscending);
        assert!(editor.todos_on_top);
        assert!(!editor.show_task_color);
        assert!(!editor.show_due_color);
    }

    #[test]
    fn format_document_sorts_and_keeps_prose() {
        let editor = editor_settings(
            EditorSettings::default(),
            Some(SortArg::Priority),
            false,
            true,
        );
        let text = "# Chores\n- [ ] Sweep <!--1-->\n- [ ] Dishes (p1) <!--2-->\n";
        assert_eq!(
            format_document(text, &editor, today()),
            "# Chores\n- [ ] Dishes (p1) <!--2-->\n- [ ] Sweep <!--1-->\n"
        );
    }

    #[test]
    fn missing_settings_path_means_defaults() {
        let settings = load_settings(None).expect("defaults");
        assert_eq!(settings, Settings::default());
    }
}
