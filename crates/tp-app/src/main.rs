//! `tabproj`: print a sorted, filtered and selected view of a table

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tp_core::{ArtifactScope, MappingSettings, ProjectionSettings, SortOrder};
use tp_data::{CsvOptions, MemorySource, SqliteSource};
use tp_proxy::{Projection, SourceHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    /// Keep every index in memory
    Memory,
    /// Keep the index chain in a mapping table next to the data
    Query,
}

#[derive(Debug, Parser)]
#[command(name = "tabproj", version, about = "Project a CSV file or SQLite table through sort, filter and selection")]
struct Cli {
    /// CSV file or SQLite database
    path: PathBuf,

    /// Table to open in a SQLite database
    #[arg(long)]
    table: Option<String>,

    /// Integer column holding row ids in a CSV file
    #[arg(long)]
    key: Option<String>,

    /// Projection strategy; SQLite tables default to `query`
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Sort column, optionally suffixed with `:desc`
    #[arg(long)]
    sort: Option<String>,

    /// Only show rows matching this predicate
    #[arg(long)]
    filter: Option<String>,

    /// Select the visible rows matching this predicate
    #[arg(long)]
    select: Option<String>,

    /// Invert the selection
    #[arg(long)]
    invert: bool,

    /// Only show selected rows
    #[arg(long)]
    selected_only: bool,

    /// Rows to hide, by 0-based position in the table; applied together
    /// before sorting
    #[arg(long, value_delimiter = ',')]
    hide: Vec<usize>,

    /// Rows to print
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// JSON projection settings; without them the query strategy keeps its
    /// mapping table in temporary storage
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `tp_proxy=trace`
    #[arg(long, env = "TABPROJ_LOG", default_value = "warn")]
    log: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).context("Invalid log filter")?)
        .with_writer(std::io::stderr)
        .init();

    let settings = load_settings(&cli)?;
    let source = open_source(&cli)?;
    let mut projection = Projection::new(settings)?;
    projection.attach(source)?;

    apply(&cli, &mut projection)?;
    print_rows(&mut projection, cli.limit)?;

    projection.detach()?;
    Ok(())
}

/// Settings from `--settings`, or defaults that leave the database untouched
fn load_settings(cli: &Cli) -> Result<ProjectionSettings> {
    match &cli.settings {
        Some(path) => ProjectionSettings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => Ok(ProjectionSettings {
            mapping: MappingSettings {
                scope: ArtifactScope::Session,
                ..MappingSettings::default()
            },
            ..ProjectionSettings::default()
        }),
    }
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "csv" | "tsv" | "txt"))
        .unwrap_or(false)
}

fn open_source(cli: &Cli) -> Result<SourceHandle> {
    if is_csv(&cli.path) {
        if cli.strategy == Some(StrategyArg::Query) {
            bail!("The query strategy needs a SQLite table");
        }
        let mut options = CsvOptions {
            key_column: cli.key.clone(),
            ..CsvOptions::default()
        };
        if cli.path.extension().and_then(|ext| ext.to_str()) == Some("tsv") {
            options.delimiter = b'\t';
        }
        let source = MemorySource::from_csv(&cli.path, &options)
            .with_context(|| format!("Failed to read {}", cli.path.display()))?;
        info!("Loaded {}", cli.path.display());
        return Ok(SourceHandle::Memory(Arc::new(source)));
    }

    let table = match &cli.table {
        Some(table) => table.clone(),
        None => {
            let tables = SqliteSource::list_tables(&cli.path)
                .with_context(|| format!("Failed to open {}", cli.path.display()))?;
            match tables.as_slice() {
                [only] => only.clone(),
                [] => bail!("{} has no tables", cli.path.display()),
                _ => bail!("Pick a table with --table: {}", tables.join(", ")),
            }
        }
    };

    let source = Arc::new(
        SqliteSource::open(&cli.path, table.as_str())
            .with_context(|| format!("Failed to open table {}", table))?,
    );
    Ok(match cli.strategy.unwrap_or(StrategyArg::Query) {
        StrategyArg::Memory => SourceHandle::Memory(source),
        StrategyArg::Query => SourceHandle::Query(source),
    })
}

fn column_named(projection: &Projection, name: &str) -> Result<usize> {
    let count = projection.column_count()?;
    let mut fallback = None;
    for col in 0..count {
        let header = projection.header_name(col)?;
        if header == name {
            return Ok(col);
        }
        if fallback.is_none() && header.eq_ignore_ascii_case(name) {
            fallback = Some(col);
        }
    }
    fallback.with_context(|| format!("No column named {}", name))
}

fn parse_sort(projection: &Projection, spec: &str) -> Result<(usize, SortOrder)> {
    let (name, order) = match spec.rsplit_once(':') {
        Some((name, dir)) if dir.eq_ignore_ascii_case("desc") => (name, SortOrder::Descending),
        Some((name, dir)) if dir.eq_ignore_ascii_case("asc") => (name, SortOrder::Ascending),
        _ => (spec, SortOrder::Ascending),
    };
    Ok((column_named(projection, name)?, order))
}

fn apply(cli: &Cli, projection: &mut Projection) -> Result<()> {
    if !cli.hide.is_empty() {
        let hidden = projection.hide(&cli.hide)?;
        debug!("Hid {} rows", hidden);
    }
    if let Some(spec) = &cli.sort {
        let (col, order) = parse_sort(projection, spec)?;
        projection.sort(col, order)?;
    }
    if let Some(predicate) = &cli.filter {
        projection
            .set_filter(predicate, true)
            .with_context(|| format!("Bad filter {:?}", predicate))?;
    }
    if let Some(predicate) = &cli.select {
        projection
            .set_filter(predicate, false)
            .with_context(|| format!("Bad selection {:?}", predicate))?;
    }
    if cli.invert {
        projection.invert_selection()?;
    }
    if cli.selected_only {
        projection.set_selected_only(true)?;
    }
    Ok(())
}

fn print_rows(projection: &mut Projection, limit: usize) -> Result<()> {
    let columns = projection.column_count()?;
    let selected: HashSet<_> = projection.selected_ids()?.into_iter().collect();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    let mut header = vec!["".to_string(), "row".to_string()];
    for col in 0..columns {
        header.push(projection.header_name(col)?);
    }
    table.set_header(header);

    let rows = projection.row_count()?;
    for row in 0..rows.min(limit) {
        let id = projection.map_filter_to_source(row)?;
        let marker = if selected.contains(&id) { "*" } else { "" };
        let mut cells = vec![marker.to_string(), id.to_string()];
        for col in 0..columns {
            cells.push(projection.data(row, col)?.to_string());
        }
        table.add_row(cells);
    }
    println!("{table}");

    let mut summary = format!(
        "{} of {} rows shown, {} selected",
        rows,
        projection.raw_row_count()?,
        selected.len()
    );
    if rows > limit {
        summary.push_str(&format!(", first {} printed", limit));
    }
    if let Some(key) = projection.sort_state() {
        summary.push_str(&format!(
            ", sorted by {} {}",
            projection.header_name(key.column)?,
            key.order.sql().to_ascii_lowercase()
        ));
    }
    println!("{}", summary);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tp_core::{CellValue, ColumnDescriptor, ColumnKind, SourceRowId};

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tabproj").chain(args.iter().copied())).unwrap()
    }

    /// ids 1..=5 with value [3, 1, 4, 1, 5]
    fn projection() -> Projection {
        let source = MemorySource::from_columns(
            "parcels",
            vec![
                (
                    ColumnDescriptor::new("id", ColumnKind::Integer),
                    (1..=5).map(CellValue::Integer).collect(),
                ),
                (
                    ColumnDescriptor::new("Value", ColumnKind::Integer),
                    [3, 1, 4, 1, 5].into_iter().map(CellValue::Integer).collect(),
                ),
                (
                    ColumnDescriptor::new("value", ColumnKind::Text),
                    ["c", "a", "d", "b", "e"].into_iter().map(CellValue::from).collect(),
                ),
                (
                    ColumnDescriptor::new("owner:name", ColumnKind::Text),
                    ["x", "y", "x", "y", "x"].into_iter().map(CellValue::from).collect(),
                ),
            ],
            Some("id"),
        )
        .unwrap();
        let mut projection = Projection::new(ProjectionSettings::default()).unwrap();
        projection.attach(SourceHandle::Memory(Arc::new(source))).unwrap();
        projection
    }

    fn ids(raw: &[i64]) -> Vec<SourceRowId> {
        raw.iter().copied().map(SourceRowId).collect()
    }

    #[test]
    fn test_column_named_prefers_exact_match() {
        let projection = projection();
        assert_eq!(column_named(&projection, "Value").unwrap(), 1);
        assert_eq!(column_named(&projection, "value").unwrap(), 2);
        assert_eq!(column_named(&projection, "VALUE").unwrap(), 1);
        assert_eq!(column_named(&projection, "ID").unwrap(), 0);
        assert!(column_named(&projection, "area").is_err());
    }

    #[test]
    fn test_parse_sort() {
        let projection = projection();
        assert_eq!(parse_sort(&projection, "Value").unwrap(), (1, SortOrder::Ascending));
        assert_eq!(parse_sort(&projection, "Value:desc").unwrap(), (1, SortOrder::Descending));
        assert_eq!(parse_sort(&projection, "value:ASC").unwrap(), (2, SortOrder::Ascending));
        // a suffix that is not a direction belongs to the name
        assert_eq!(parse_sort(&projection, "owner:name").unwrap(), (3, SortOrder::Ascending));
        assert_eq!(
            parse_sort(&projection, "owner:name:desc").unwrap(),
            (3, SortOrder::Descending)
        );
        assert!(parse_sort(&projection, "area:desc").is_err());
    }

    #[test]
    fn test_apply_hides_sorts_filters_and_selects() {
        let mut projection = projection();
        let cli = cli(&[
            "parcels.csv",
            "--hide",
            "0,2",
            "--sort",
            "Value:desc",
            "--filter",
            "Value > 0",
            "--select",
            "\"owner:name\" = 'x'",
        ]);
        assert_eq!(cli.hide, vec![0, 2]);
        apply(&cli, &mut projection).unwrap();

        assert_eq!(projection.raw_row_count().unwrap(), 3);
        // ties on Value keep no particular order
        let order = projection.filter_order().unwrap();
        assert_eq!(order[0], SourceRowId(5));
        assert_eq!(order.len(), 3);
        assert_eq!(projection.selected_ids().unwrap(), ids(&[5]));
    }

    #[test]
    fn test_apply_inverts_and_restricts_to_selection() {
        let mut projection = projection();
        let cli = cli(&[
            "parcels.csv",
            "--sort",
            "id:desc",
            "--select",
            "Value = 1",
            "--invert",
            "--selected-only",
        ]);
        apply(&cli, &mut projection).unwrap();
        assert_eq!(projection.filter_order().unwrap(), ids(&[5, 3, 1]));
        assert_eq!(projection.selected_ids().unwrap(), ids(&[1, 3, 5]));
    }

    #[test]
    fn test_apply_reports_bad_filter() {
        let mut projection = projection();
        let err = apply(&cli(&["parcels.csv", "--filter", "area > 1"]), &mut projection).unwrap_err();
        assert!(err.to_string().contains("Bad filter"));
    }

    #[test]
    fn test_default_settings_leave_no_mapping_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parcels.sqlite");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE parcels (id INTEGER PRIMARY KEY, value INTEGER);
             INSERT INTO parcels VALUES (1, 3), (2, 1), (3, 4);",
        )
        .unwrap();
        drop(conn);

        let path_arg = path.to_string_lossy().into_owned();
        let cli = cli(&[path_arg.as_str(), "--sort", "value"]);
        let settings = load_settings(&cli).unwrap();
        assert_eq!(settings.mapping.scope, ArtifactScope::Session);

        let mut projection = Projection::new(settings).unwrap();
        projection.attach(open_source(&cli).unwrap()).unwrap();
        apply(&cli, &mut projection).unwrap();
        assert_eq!(projection.filter_order().unwrap(), ids(&[2, 1, 3]));
        projection.detach().unwrap();

        assert_eq!(SqliteSource::list_tables(&path).unwrap(), vec!["parcels".to_string()]);
    }

    #[test]
    fn test_settings_file_overrides_session_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"mapping": {"scope": "persistent"}}"#).unwrap();

        let path_arg = path.to_string_lossy().into_owned();
        let cli = cli(&["parcels.sqlite", "--settings", path_arg.as_str()]);
        assert_eq!(load_settings(&cli).unwrap().mapping.scope, ArtifactScope::Persistent);
    }
}
