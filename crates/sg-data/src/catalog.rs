use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sg_types::{CatalogError, SgResult, Table};

/// Whether a parameter is a model input or output for a given network type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Feature,
    Target,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "feature" => Ok(Role::Feature),
            "target" => Ok(Role::Target),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Feature => write!(f, "feature"),
            Role::Target => write!(f, "target"),
        }
    }
}

/// A named scalar parameter with bounds and per-network metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub domain: String,
    /// network type -> role
    pub role: BTreeMap<String, Role>,
    /// network type -> loss weight
    pub weight: BTreeMap<String, f64>,
    pub min: f64,
    pub max: f64,
    /// Dense, zero-based registration index.
    pub column_id: usize,
}

impl Parameter {
    pub fn extent(&self) -> f64 {
        self.max - self.min
    }

    pub fn role_for(&self, network: &str) -> Option<Role> {
        self.role.get(network).copied()
    }

    pub fn weight_for(&self, network: &str) -> f64 {
        self.weight.get(network).copied().unwrap_or(1.0)
    }
}

/// Cached per-domain bounds, computed by [`ParameterCatalog::finalize`].
#[derive(Debug, Clone)]
struct DomainInfo {
    columns: Vec<usize>,
    min: Vec<f64>,
    extent: Vec<f64>,
}

/// Registry of every parameter the generators know about.
///
/// Parameters are registered once at startup; [`ParameterCatalog::finalize`]
/// then freezes the catalog and caches the per-domain affine transforms.
#[derive(Debug, Clone, Default)]
pub struct ParameterCatalog {
    params: Vec<Parameter>,
    index: HashMap<String, usize>,
    domains: Option<BTreeMap<String, DomainInfo>>,
}

impl ParameterCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter and return its column id.
    pub fn register(
        &mut self,
        name: &str,
        domain: &str,
        role: BTreeMap<String, Role>,
        weight: BTreeMap<String, f64>,
        min: f64,
        max: f64,
    ) -> SgResult<usize> {
        if self.domains.is_some() {
            return Err(CatalogError::AlreadyBuilt { name: name.to_string() }.into());
        }
        if self.index.contains_key(name) {
            return Err(CatalogError::DuplicateParameter { name: name.to_string() }.into());
        }

        let column_id = self.params.len();
        self.params.push(Parameter {
            name: name.to_string(),
            domain: domain.to_string(),
            role,
            weight,
            min,
            max,
            column_id,
        });
        self.index.insert(name.to_string(), column_id);

        tracing::trace!("Registered parameter {} ({}) as column {}", name, domain, column_id);
        Ok(column_id)
    }

    /// Compute the per-domain subsets and bound vectors.
    pub fn finalize(&mut self) -> SgResult<()> {
        let mut domains: BTreeMap<String, DomainInfo> = BTreeMap::new();
        for param in &self.params {
            let info = domains.entry(param.domain.clone()).or_insert_with(|| DomainInfo {
                columns: Vec::new(),
                min: Vec::new(),
                extent: Vec::new(),
            });
            info.columns.push(param.column_id);
            info.min.push(param.min);
            info.extent.push(param.extent());
        }

        tracing::debug!(
            "Parameter catalog built: {} parameters in {} domains",
            self.params.len(),
            domains.len()
        );
        self.domains = Some(domains);
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.domains.is_some()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Parameter> {
        self.index.get(name).map(|&i| &self.params[i])
    }

    /// Look up `name` in a full catalog-ordered parameter row.
    pub fn value(&self, name: &str, row: &[f64]) -> SgResult<f64> {
        let param = self
            .param(name)
            .ok_or_else(|| CatalogError::UnknownParameter { name: name.to_string() })?;
        row.get(param.column_id).copied().ok_or_else(|| {
            CatalogError::ShapeMismatch {
                expected: format!("at least {} values", param.column_id + 1),
                actual: format!("{} values", row.len()),
            }
            .into()
        })
    }

    pub fn domains(&self) -> SgResult<Vec<&str>> {
        Ok(self.built()?.keys().map(String::as_str).collect())
    }

    /// Parameters of `domain`, in column order.
    pub fn domain_params(&self, domain: &str) -> SgResult<Vec<&Parameter>> {
        let info = self.domain_info(domain)?;
        Ok(info.columns.iter().map(|&i| &self.params[i]).collect())
    }

    /// Column names of `domain`, in column order.
    pub fn domain_columns(&self, domain: &str) -> SgResult<Vec<String>> {
        Ok(self
            .domain_params(domain)?
            .into_iter()
            .map(|p| p.name.clone())
            .collect())
    }

    pub fn domain_len(&self, domain: &str) -> SgResult<usize> {
        Ok(self.domain_info(domain)?.columns.len())
    }

    /// `min + normalized * (max - min)`, row-major over the domain's columns.
    pub fn denormalize(&self, domain: &str, normalized: &[f64]) -> SgResult<Vec<f64>> {
        let info = self.domain_info(domain)?;
        self.check_extents(info)?;
        Self::apply(info, normalized, |v, min, extent| min + v * extent)
    }

    /// `(value - min) / (max - min)`, row-major over the domain's columns.
    pub fn normalize(&self, domain: &str, values: &[f64]) -> SgResult<Vec<f64>> {
        let info = self.domain_info(domain)?;
        self.check_extents(info)?;
        Self::apply(info, values, |v, min, extent| (v - min) / extent)
    }

    /// Denormalize a table whose columns are named after catalog parameters.
    pub fn denormalize_table(&self, table: &Table) -> SgResult<Table> {
        self.transform_table(table, |v, p| p.min + v * p.extent())
    }

    /// Normalize a table whose columns are named after catalog parameters.
    pub fn normalize_table(&self, table: &Table) -> SgResult<Table> {
        self.transform_table(table, |v, p| (v - p.min) / p.extent())
    }

    /// Parameters tagged with `role` for `network`, in column order.
    pub fn filter_params(&self, network: &str, role: Role) -> Vec<&Parameter> {
        self.params
            .iter()
            .filter(|p| p.role_for(network) == Some(role))
            .collect()
    }

    /// Select the `(network, role)` columns across `tables`, in catalog order.
    ///
    /// Each column is taken from the first table that has it; all source
    /// tables must have the same number of rows.
    pub fn extract_columns(&self, tables: &[&Table], network: &str, role: Role) -> SgResult<Table> {
        self.built()?;

        let rows = tables.first().map(|t| t.num_rows()).unwrap_or(0);
        if let Some(t) = tables.iter().find(|t| t.num_rows() != rows) {
            return Err(CatalogError::ShapeMismatch {
                expected: format!("{rows} rows in every source table"),
                actual: format!("{} rows", t.num_rows()),
            }
            .into());
        }

        let mut sources = Vec::new();
        for param in self.filter_params(network, role) {
            let (table_idx, col_idx) = tables
                .iter()
                .enumerate()
                .find_map(|(ti, t)| t.column_index(&param.name).map(|ci| (ti, ci)))
                .ok_or_else(|| CatalogError::UnknownColumn { column: param.name.clone() })?;
            sources.push((param.name.clone(), table_idx, col_idx));
        }

        let mut values = Vec::with_capacity(rows * sources.len());
        for r in 0..rows {
            for (_, ti, ci) in &sources {
                let row = tables[*ti].row(r).unwrap_or(&[]);
                values.push(row[*ci]);
            }
        }

        Table::new(sources.into_iter().map(|(name, _, _)| name).collect(), values)
    }

    /// Loss weights of every target parameter for `network`.
    pub fn target_weights(&self, network: &str) -> Vec<f64> {
        self.filter_params(network, Role::Target)
            .into_iter()
            .map(|p| p.weight_for(network))
            .collect()
    }

    fn built(&self) -> SgResult<&BTreeMap<String, DomainInfo>> {
        self.domains.as_ref().ok_or_else(|| CatalogError::NotBuilt.into())
    }

    fn domain_info(&self, domain: &str) -> SgResult<&DomainInfo> {
        self.built()?
            .get(domain)
            .ok_or_else(|| CatalogError::UnknownDomain { domain: domain.to_string() }.into())
    }

    fn check_extents(&self, info: &DomainInfo) -> SgResult<()> {
        for (&col, &extent) in info.columns.iter().zip(&info.extent) {
            if extent == 0.0 || !extent.is_finite() {
                let p = &self.params[col];
                return Err(CatalogError::DegenerateRange {
                    name: p.name.clone(),
                    min: p.min,
                    max: p.max,
                }
                .into());
            }
        }
        Ok(())
    }

    fn apply(
        info: &DomainInfo,
        values: &[f64],
        f: impl Fn(f64, f64, f64) -> f64,
    ) -> SgResult<Vec<f64>> {
        let width = info.columns.len();
        if width == 0 || values.len() % width != 0 {
            return Err(CatalogError::ShapeMismatch {
                expected: format!("rows of {width} values"),
                actual: format!("{} values", values.len()),
            }
            .into());
        }

        Ok(values
            .chunks(width)
            .flat_map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(i, &v)| f(v, info.min[i], info.extent[i]))
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    fn transform_table(&self, table: &Table, f: impl Fn(f64, &Parameter) -> f64) -> SgResult<Table> {
        self.built()?;
        let params = table
            .columns()
            .iter()
            .map(|name| {
                let p = self
                    .param(name)
                    .ok_or_else(|| CatalogError::UnknownParameter { name: name.clone() })?;
                if p.extent() == 0.0 || !p.extent().is_finite() {
                    return Err(CatalogError::DegenerateRange {
                        name: p.name.clone(),
                        min: p.min,
                        max: p.max,
                    });
                }
                Ok(p)
            })
            .collect::<Result<Vec<_>, CatalogError>>()?;

        let width = params.len().max(1);
        let values = table
            .values()
            .chunks(width)
            .flat_map(|row| row.iter().zip(&params).map(|(&v, p)| f(v, p)).collect::<Vec<_>>())
            .collect();

        Table::new(table.columns().to_vec(), values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg_types::SgError;

    fn roles(pairs: &[(&str, Role)]) -> BTreeMap<String, Role> {
        pairs.iter().map(|(n, r)| (n.to_string(), *r)).collect()
    }

    fn eye_catalog() -> ParameterCatalog {
        let mut catalog = ParameterCatalog::new();
        let feature = roles(&[("ann", Role::Feature)]);
        let target = roles(&[("ann", Role::Target)]);
        catalog.register("A", "eye", feature.clone(), BTreeMap::new(), 0.0, 1.0).unwrap();
        catalog.register("B", "eye", feature.clone(), BTreeMap::new(), 0.0, 10.0).unwrap();
        catalog
            .register("Z1", "aberration", target.clone(), [("ann".to_string(), 2.0)].into(), -1.0, 1.0)
            .unwrap();
        catalog.register("C", "eye", feature, BTreeMap::new(), -5.0, 5.0).unwrap();
        catalog.finalize().unwrap();
        catalog
    }

    #[test]
    fn test_column_ids_follow_registration_order() {
        let catalog = eye_catalog();
        let ids: Vec<usize> = catalog.params().iter().map(|p| p.column_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(catalog.domain_columns("eye").unwrap(), vec!["A", "B", "C"]);
        assert_eq!(catalog.domain_len("aberration").unwrap(), 1);
    }

    #[test]
    fn test_duplicate_and_frozen_registration() {
        let mut catalog = ParameterCatalog::new();
        catalog.register("A", "eye", BTreeMap::new(), BTreeMap::new(), 0.0, 1.0).unwrap();
        let dup = catalog.register("A", "eye", BTreeMap::new(), BTreeMap::new(), 0.0, 1.0);
        assert!(matches!(dup, Err(SgError::Catalog(CatalogError::DuplicateParameter { .. }))));

        catalog.finalize().unwrap();
        let late = catalog.register("B", "eye", BTreeMap::new(), BTreeMap::new(), 0.0, 1.0);
        assert!(matches!(late, Err(SgError::Catalog(CatalogError::AlreadyBuilt { .. }))));
    }

    #[test]
    fn test_requires_finalize() {
        let mut catalog = ParameterCatalog::new();
        catalog.register("A", "eye", BTreeMap::new(), BTreeMap::new(), 0.0, 1.0).unwrap();
        let result = catalog.denormalize("eye", &[0.5]);
        assert!(matches!(result, Err(SgError::Catalog(CatalogError::NotBuilt))));
    }

    #[test]
    fn test_normalize_denormalize_inverse() {
        let catalog = eye_catalog();
        let normalized = vec![0.0, 0.5, 1.0, 0.25, 0.75, 0.1];
        let values = catalog.denormalize("eye", &normalized).unwrap();
        assert_eq!(values[..3], [0.0, 5.0, 5.0]);

        let back = catalog.normalize("eye", &values).unwrap();
        for (a, b) in normalized.iter().zip(&back) {
            assert!((a - b).abs() < 1e-12);
        }

        let raw = vec![0.3, 7.0, -2.0];
        let again = catalog.denormalize("eye", &catalog.normalize("eye", &raw).unwrap()).unwrap();
        for (a, b) in raw.iter().zip(&again) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_degenerate_range() {
        let mut catalog = ParameterCatalog::new();
        catalog.register("Fixed", "eye", BTreeMap::new(), BTreeMap::new(), 3.0, 3.0).unwrap();
        catalog.finalize().unwrap();
        let result = catalog.normalize("eye", &[3.0]);
        assert!(matches!(result, Err(SgError::Catalog(CatalogError::DegenerateRange { .. }))));
    }

    #[test]
    fn test_extract_columns_across_tables() {
        let catalog = eye_catalog();
        let eye = Table::new(
            vec!["C".into(), "A".into(), "B".into()],
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        )
        .unwrap();
        let aberration = Table::new(vec!["Z1".into()], vec![0.1, 0.2]).unwrap();

        let features = catalog.extract_columns(&[&eye, &aberration], "ann", Role::Feature).unwrap();
        assert_eq!(features.columns(), &["A", "B", "C"]);
        assert_eq!(features.row(0), Some(&[2.0, 3.0, 1.0][..]));

        let targets = catalog.extract_columns(&[&eye, &aberration], "ann", Role::Target).unwrap();
        assert_eq!(targets.column("Z1"), Some(vec![0.1, 0.2]));
        assert_eq!(catalog.target_weights("ann"), vec![2.0]);

        let missing = catalog.extract_columns(&[&eye], "ann", Role::Target);
        assert!(matches!(missing, Err(SgError::Catalog(CatalogError::UnknownColumn { .. }))));
    }

    #[test]
    fn test_table_transform_by_name() {
        let catalog = eye_catalog();
        let table = Table::new(vec!["B".into(), "C".into()], vec![0.5, 0.5]).unwrap();
        let denorm = catalog.denormalize_table(&table).unwrap();
        assert_eq!(denorm.values(), &[5.0, 0.0]);
        assert_eq!(catalog.normalize_table(&denorm).unwrap(), table);
        assert_eq!(catalog.value("C", &[0.0, 0.0, 0.0, 9.0]).unwrap(), 9.0);
    }

    #[test]
    fn test_uniform_samples_land_in_bounds() {
        // 8 normalized samples from a fixed linear congruential sequence
        let catalog = eye_catalog();
        let mut state: u64 = 12345;
        let normalized: Vec<f64> = (0..8 * 3)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 11) as f64 / (1u64 << 53) as f64
            })
            .collect();

        let values = catalog.denormalize("eye", &normalized).unwrap();
        let params = catalog.domain_params("eye").unwrap();
        for row in values.chunks(3) {
            for (v, p) in row.iter().zip(&params) {
                assert!(*v >= p.min && *v <= p.max, "{} = {} outside bounds", p.name, v);
            }
        }
    }
}
