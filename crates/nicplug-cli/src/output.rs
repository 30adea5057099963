use serde::Serialize;
use tabled::Tabled;

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl OutputFormat {
    /// Parse from the `-o` argument. Unknown values fall back to a table.
    pub fn from_str_arg(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Table,
        }
    }
}

/// Render rows as a rounded table, or "(none)" when empty.
pub fn table<T: Tabled>(items: &[T]) -> String {
    if items.is_empty() {
        return "(none)".to_string();
    }
    tabled::Table::new(items)
        .with(tabled::settings::Style::rounded())
        .to_string()
}

/// Print any serializable value as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Tabled)]
    struct Row {
        name: String,
        count: u32,
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(OutputFormat::from_str_arg("json"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str_arg("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str_arg("table"), OutputFormat::Table);
        assert_eq!(OutputFormat::from_str_arg("yaml"), OutputFormat::Table);
    }

    #[test]
    fn test_table_renders_headers() {
        let rendered = table(&[Row {
            name: "iface1".to_string(),
            count: 1,
        }]);
        assert!(rendered.contains("name"));
        assert!(rendered.contains("iface1"));
    }

    #[test]
    fn test_empty_table() {
        let rows: Vec<Row> = Vec::new();
        assert_eq!(table(&rows), "(none)");
    }
}
