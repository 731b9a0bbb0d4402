//! Tables printed by the commands.

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};
use olm_core::download::format_bytes;
use olm_core::install::BackupRecord;
use olm_core::ollama::{ModelInfo, RunningModel};
use olm_core::registry::{DownloadTask, TaskStatus};

pub fn models_table(models: &[ModelInfo]) -> Table {
    let mut table = styled(vec!["Name", "Size", "Digest", "Modified"]);
    align_column(&mut table, 1, CellAlignment::Right);

    let mut total = 0u64;
    for model in models {
        total += model.size;
        table.add_row(vec![
            name_cell(&model.name),
            Cell::new(format_bytes(model.size)),
            dim_cell(short_digest(&model.digest)),
            Cell::new(&model.modified_at),
        ]);
    }
    table.add_row(vec![
        total_cell(format!("{} model(s)", models.len())),
        Cell::new(format_bytes(total)).add_attribute(Attribute::Bold),
        dim_cell("-"),
        dim_cell("-"),
    ]);
    table
}

pub fn running_table(models: &[RunningModel]) -> Table {
    let mut table = styled(vec!["Name", "Size", "VRAM", "Expires"]);
    align_column(&mut table, 1, CellAlignment::Right);
    align_column(&mut table, 2, CellAlignment::Right);

    let mut vram = 0u64;
    for model in models {
        vram += model.size_vram;
        table.add_row(vec![
            name_cell(&model.name),
            Cell::new(format_bytes(model.size)),
            Cell::new(format_bytes(model.size_vram)),
            Cell::new(&model.expires_at),
        ]);
    }
    table.add_row(vec![
        total_cell(format!("{} loaded", models.len())),
        dim_cell("-"),
        Cell::new(format_bytes(vram)).add_attribute(Attribute::Bold),
        dim_cell("-"),
    ]);
    table
}

pub fn tasks_table(tasks: &[DownloadTask]) -> Table {
    let mut table = styled(vec!["Task", "Status", "Progress", "Downloaded", "Speed", "ETA", "Error"]);
    align_column(&mut table, 2, CellAlignment::Right);
    align_column(&mut table, 3, CellAlignment::Right);

    for task in tasks {
        let downloaded = if task.total_size.is_empty() {
            task.downloaded_size.clone()
        } else {
            format!("{} / {}", task.downloaded_size, task.total_size)
        };
        table.add_row(vec![
            name_cell(&task.name),
            status_cell(task.status),
            Cell::new(format!("{:.1}%", task.progress)),
            Cell::new(downloaded),
            or_dash(&task.speed),
            or_dash(&task.eta),
            task.error
                .as_deref()
                .map_or_else(|| dim_cell("-"), |e| Cell::new(e).fg(Color::Red)),
        ]);
    }
    table
}

pub fn backups_table(backups: &[(BackupRecord, u64)]) -> Table {
    let mut table = styled(vec!["Backup", "Version", "Created", "Size", "Paths"]);
    align_column(&mut table, 3, CellAlignment::Right);

    for (i, (record, size)) in backups.iter().enumerate() {
        let name = record
            .backup_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = if i == 0 {
            name_cell(&name)
        } else {
            Cell::new(name)
        };
        table.add_row(vec![
            name,
            Cell::new(&record.version),
            Cell::new(record.timestamp.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(format_bytes(*size)),
            Cell::new(record.paths.join(", ")),
        ]);
    }
    table
}

fn styled(headers: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_width(120);
    table.set_header(headers.into_iter().map(header_cell).collect::<Vec<_>>());
    table
}

fn align_column(table: &mut Table, index: usize, alignment: CellAlignment) {
    if let Some(column) = table.column_mut(index) {
        column.set_cell_alignment(alignment);
    }
}

fn short_digest(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    hex.chars().take(12).collect()
}

fn status_cell(status: TaskStatus) -> Cell {
    let color = match status {
        TaskStatus::Downloading => Color::Blue,
        TaskStatus::Queued => Color::Cyan,
        TaskStatus::Paused => Color::Yellow,
        TaskStatus::Completed => Color::Green,
        TaskStatus::Failed => Color::Red,
        TaskStatus::Cancelled => Color::DarkGrey,
    };
    Cell::new(status).fg(color)
}

fn header_cell(label: &str) -> Cell {
    Cell::new(label)
        .fg(Color::Cyan)
        .add_attribute(Attribute::Bold)
}

fn name_cell(name: &str) -> Cell {
    Cell::new(name)
        .fg(Color::Blue)
        .add_attribute(Attribute::Bold)
}

fn total_cell(label: String) -> Cell {
    Cell::new(label)
        .fg(Color::Cyan)
        .add_attribute(Attribute::Bold)
}

fn or_dash(value: &str) -> Cell {
    if value.is_empty() {
        dim_cell("-")
    } else {
        Cell::new(value)
    }
}

fn dim_cell<T: ToString>(value: T) -> Cell {
    Cell::new(value).fg(Color::DarkGrey)
}
