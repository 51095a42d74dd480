use std::collections::BTreeMap;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use sg_types::{CatalogError, SgResult};

use crate::catalog::{ParameterCatalog, Role};

/// Loads a [`ParameterCatalog`] from a `;`-delimited parameter table.
///
/// The header must contain `name`, `domain`, `min` and `max`. Any column
/// named `role_<network>` or `weight_<network>` attaches per-network
/// metadata; empty cells are skipped.
#[derive(Debug, Clone)]
pub struct ParameterTableLoader {
    delimiter: u8,
}

impl Default for ParameterTableLoader {
    fn default() -> Self {
        Self { delimiter: b';' }
    }
}

#[derive(Debug)]
struct HeaderLayout {
    name: usize,
    domain: usize,
    min: usize,
    max: usize,
    roles: Vec<(usize, String)>,
    weights: Vec<(usize, String)>,
}

impl ParameterTableLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiter(delimiter: u8) -> Self {
        Self { delimiter }
    }

    /// Read the table and return a finalized catalog.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> SgResult<ParameterCatalog> {
        let path = path.as_ref();
        tracing::info!("Loading parameter table from: {}", path.display());

        let file = std::fs::File::open(path)?;
        let catalog = self.load_from_reader(file)?;

        tracing::info!("Loaded {} parameters from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    pub fn load_from_reader<R: std::io::Read>(&self, reader: R) -> SgResult<ParameterCatalog> {
        let mut rdr = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr
            .headers()
            .map_err(|e| CatalogError::Parse { line: 1, message: e.to_string() })?
            .clone();
        let layout = Self::detect_columns(&headers)?;

        let mut catalog = ParameterCatalog::new();
        for (i, result) in rdr.records().enumerate() {
            // header is line 1
            let line = i + 2;
            let record = result.map_err(|e| CatalogError::Parse { line, message: e.to_string() })?;
            if record.iter().all(|field| field.is_empty()) {
                continue;
            }
            self.parse_record(&mut catalog, &record, &layout, line)?;
        }

        catalog.finalize()?;
        Ok(catalog)
    }

    fn detect_columns(headers: &StringRecord) -> SgResult<HeaderLayout> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
                .ok_or_else(|| CatalogError::Parse {
                    line: 1,
                    message: format!("missing required column '{name}'"),
                })
        };

        let mut roles = Vec::new();
        let mut weights = Vec::new();
        for (i, header) in headers.iter().enumerate() {
            if let Some(network) = header.strip_prefix("role_") {
                roles.push((i, network.to_string()));
            } else if let Some(network) = header.strip_prefix("weight_") {
                weights.push((i, network.to_string()));
            }
        }

        Ok(HeaderLayout {
            name: find("name")?,
            domain: find("domain")?,
            min: find("min")?,
            max: find("max")?,
            roles,
            weights,
        })
    }

    fn parse_record(
        &self,
        catalog: &mut ParameterCatalog,
        record: &StringRecord,
        layout: &HeaderLayout,
        line: usize,
    ) -> SgResult<()> {
        let field = |idx: usize| record.get(idx).unwrap_or("");
        let number = |idx: usize, what: &str| {
            field(idx).parse::<f64>().map_err(|_| CatalogError::Parse {
                line,
                message: format!("invalid {what} '{}'", field(idx)),
            })
        };

        let name = field(layout.name);
        if name.is_empty() {
            return Err(CatalogError::Parse { line, message: "empty parameter name".to_string() }.into());
        }

        let mut role = BTreeMap::new();
        for (idx, network) in &layout.roles {
            let cell = field(*idx);
            if cell.is_empty() {
                continue;
            }
            let parsed: Role = cell
                .parse()
                .map_err(|message| CatalogError::Parse { line, message })?;
            role.insert(network.clone(), parsed);
        }

        let mut weight = BTreeMap::new();
        for (idx, network) in &layout.weights {
            if field(*idx).is_empty() {
                continue;
            }
            weight.insert(network.clone(), number(*idx, "weight")?);
        }

        catalog.register(
            name,
            field(layout.domain),
            role,
            weight,
            number(layout.min, "min")?,
            number(layout.max, "max")?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg_types::SgError;
    use std::io::Write;

    const TABLE: &str = "\
name;domain;min;max;role_ann;role_gbt;weight_ann
AxialLength;eye;20;30;feature;feature;
CorneaK;eye;38;48;feature;;
Z40;aberration;-1;1;target;target;2.5
";

    #[test]
    fn test_parameter_table_loading() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TABLE.as_bytes()).unwrap();

        let catalog = ParameterTableLoader::new().load(file.path()).unwrap();
        assert!(catalog.is_built());
        assert_eq!(catalog.len(), 3);

        let z40 = catalog.param("Z40").unwrap();
        assert_eq!(z40.column_id, 2);
        assert_eq!(z40.role_for("gbt"), Some(Role::Target));
        assert_eq!(z40.weight_for("ann"), 2.5);

        let cornea = catalog.param("CorneaK").unwrap();
        assert_eq!(cornea.role_for("gbt"), None);
        assert_eq!(cornea.weight_for("ann"), 1.0);
        assert_eq!(catalog.domain_columns("eye").unwrap(), vec!["AxialLength", "CorneaK"]);
    }

    #[test]
    fn test_malformed_row_reports_line() {
        let table = "name;domain;min;max\nA;eye;0;1\nB;eye;zero;1\n";
        let result = ParameterTableLoader::new().load_from_reader(table.as_bytes());
        match result {
            Err(SgError::Catalog(CatalogError::Parse { line, .. })) => assert_eq!(line, 3),
            other => panic!("Expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_column_and_duplicates() {
        let no_max = "name;domain;min\nA;eye;0\n";
        assert!(ParameterTableLoader::new().load_from_reader(no_max.as_bytes()).is_err());

        let dup = "name;domain;min;max\nA;eye;0;1\nA;eye;0;1\n";
        let result = ParameterTableLoader::new().load_from_reader(dup.as_bytes());
        assert!(matches!(result, Err(SgError::Catalog(CatalogError::DuplicateParameter { .. }))));
    }

    #[test]
    fn test_custom_delimiter() {
        let table = "name,domain,min,max,role_ann\nA,eye,0,1,feature\n";
        let catalog = ParameterTableLoader::with_delimiter(b',')
            .load_from_reader(table.as_bytes())
            .unwrap();
        assert_eq!(catalog.filter_params("ann", Role::Feature).len(), 1);
    }
}
