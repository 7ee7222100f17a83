//! `create-table` command.

use anyhow::{Result, anyhow, bail};
use clap::Args;
use lakelog_core::{EnvSource, TableId};
use lakelog_statestore::{KeyType, RowKeyField, TableProperties};

use super::Context;

/// Arguments for `create-table`.
#[derive(Debug, Args)]
pub struct CreateTableArgs {
    /// Table id.
    #[arg(long = "id")]
    pub table_id: String,

    /// Row key fields as `name:type`, where type is `long`, `string` or `bytes`.
    #[arg(long = "row-key", value_delimiter = ',', default_value = "id:long")]
    pub row_keys: Vec<String>,
}

/// Registers the table, then writes its single root partition.
///
/// Table properties start from defaults overlaid with `LAKELOG_*` overrides.
///
/// # Errors
///
/// Returns an error if the table already exists or a row key is malformed.
pub async fn execute(ctx: &mut Context, args: &CreateTableArgs) -> Result<()> {
    let table_id = TableId::new(&args.table_id)?;
    let fields = args
        .row_keys
        .iter()
        .map(|spec| parse_row_key(spec))
        .collect::<Result<Vec<_>>>()?;
    let properties = TableProperties::default().with_overrides(&EnvSource)?;

    let factory = ctx.cache().factory().clone();
    factory.properties_store().create(&table_id, &properties).await?;
    factory
        .state_store(table_id.clone())
        .initialise_with_single_root(&fields)
        .await?;

    tracing::info!(table_id = %table_id, row_keys = fields.len(), "created table");
    println!("{table_id}");
    Ok(())
}

fn parse_row_key(spec: &str) -> Result<RowKeyField> {
    let (name, kind) = spec
        .split_once(':')
        .ok_or_else(|| anyhow!("row key must be name:type, got {spec:?}"))?;
    let key_type = match kind.trim().to_ascii_lowercase().as_str() {
        "long" => KeyType::Long,
        "string" => KeyType::String,
        "bytes" => KeyType::Bytes,
        other => bail!("unknown row key type {other:?}"),
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("row key name must not be empty");
    }
    Ok(RowKeyField::new(name, key_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_row_keys() {
        let field = parse_row_key("region:string").unwrap();
        assert_eq!(field.name, "region");
        assert_eq!(field.key_type, KeyType::String);
        assert!(parse_row_key("region").is_err());
        assert!(parse_row_key(":long").is_err());
        assert!(parse_row_key("id:float").is_err());
    }
}
