use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use shadow_core::{ShadowList, ShadowResource, SHADOW_KIND};
use shadow_schema::StatusPaths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub cells: Vec<String>,
}

/// Tabular projection of one or more shadow resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    #[serde(default)]
    pub column_definitions: Vec<TableColumn>,
    pub rows: Vec<TableRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableOptions {
    pub no_headers: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum TableSource<'a> {
    Single(&'a ShadowResource),
    List(&'a ShadowList),
}

fn column(name: &str, type_: &str, format: &str, description: &str) -> TableColumn {
    TableColumn { name: name.into(), type_: type_.into(), format: format.into(), description: description.into() }
}

fn columns() -> Vec<TableColumn> {
    vec![
        column("Name", "string", "name", "Name of the shadow resource"),
        column("Status", "string", "", "Aggregated status of the first component"),
        column("Created At", "date", "", "Creation time of the persisted record"),
    ]
}

/// RFC 3339 UTC, seconds precision. Unparseable input is passed through.
fn created_at(raw: Option<&str>) -> String {
    match raw {
        None => String::new(),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|_| s.to_string()),
    }
}

fn row(paths: &StatusPaths, obj: &ShadowResource) -> TableRow {
    let status = match serde_json::to_value(obj) {
        Ok(v) => paths.status_of(SHADOW_KIND, &v),
        Err(_) => obj.status.state.clone(),
    };
    TableRow {
        cells: vec![obj.name().to_string(), status, created_at(obj.metadata.creation_timestamp.as_deref())],
    }
}

/// One row per object: name, status, creation time.
pub fn convert_to_table(paths: &StatusPaths, src: TableSource<'_>, opts: &TableOptions) -> Table {
    let (rows, resource_version) = match src {
        TableSource::Single(obj) => (vec![row(paths, obj)], obj.metadata.resource_version.clone()),
        TableSource::List(list) => (
            list.items.iter().map(|o| row(paths, o)).collect(),
            list.metadata.resource_version.clone(),
        ),
    };
    Table {
        column_definitions: if opts.no_headers { Vec::new() } else { columns() },
        rows,
        resource_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sr(name: &str, state: &str) -> ShadowResource {
        let mut o = ShadowResource::stub("ns", name);
        o.status.state = state.into();
        o.metadata.creation_timestamp = Some("2024-03-01T10:00:00+02:00".into());
        o
    }

    #[test]
    fn single_object_row() {
        let t = convert_to_table(&StatusPaths::default(), TableSource::Single(&sr("a", "Running")), &TableOptions::default());
        let names: Vec<_> = t.column_definitions.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Name", "Status", "Created At"]);
        assert_eq!(t.rows[0].cells, vec!["a", "Running", "2024-03-01T08:00:00Z"]);
    }

    #[test]
    fn list_carries_resource_version_and_skips_headers() {
        let mut list = ShadowList::new(vec![sr("a", "Running"), sr("b", "deleted")]);
        list.metadata.resource_version = Some("42".into());
        let t = convert_to_table(&StatusPaths::default(), TableSource::List(&list), &TableOptions { no_headers: true });
        assert!(t.column_definitions.is_empty());
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.rows[1].cells[1], "deleted");
        assert_eq!(t.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn missing_timestamp_is_blank() {
        let mut o = sr("a", "");
        o.metadata.creation_timestamp = None;
        let t = convert_to_table(&StatusPaths::default(), TableSource::Single(&o), &TableOptions::default());
        assert_eq!(t.rows[0].cells, vec!["a", "", ""]);
    }
}
