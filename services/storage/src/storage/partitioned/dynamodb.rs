use super::{attr, Index, Item, ItemTables, KeyQuery, Table, TableError};
use crate::config::DynamoDbConfig;
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::config::Builder as DynamoConfigBuilder;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::operation::query::builders::QueryFluentBuilder;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, BillingMode, GlobalSecondaryIndex, KeySchemaElement, KeyType, Projection,
    ProjectionType, ScalarAttributeType, TableStatus,
};
use aws_sdk_dynamodb::Client as DynamoClient;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const TABLE_READY_ATTEMPTS: u32 = 30;
const TABLE_READY_INTERVAL: Duration = Duration::from_secs(2);

/// DynamoDB tables backing the partitioned store
pub struct DynamoDbTables {
    client: DynamoClient,
    sessions_table: String,
    detections_table: String,
    label_index: String,
    score_index: String,
}

impl DynamoDbTables {
    /// Create a client for the configured region and tables
    pub async fn new(config: &DynamoDbConfig) -> Result<Self> {
        if config.region.trim().is_empty() {
            return Err(StorageError::Config(
                "storage.dynamodb.region (AWS_REGION) must be set".to_string(),
            ));
        }

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut dynamo_config_builder = DynamoConfigBuilder::from(&aws_config);

        // Configure custom endpoint for DynamoDB Local/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            dynamo_config_builder = dynamo_config_builder.endpoint_url(endpoint_url);
        }

        let client = DynamoClient::from_conf(dynamo_config_builder.build());

        info!(
            region = %config.region,
            sessions_table = %config.sessions_table,
            detections_table = %config.detections_table,
            "DynamoDB client initialized"
        );

        Ok(Self {
            client,
            sessions_table: config.sessions_table.clone(),
            detections_table: config.detections_table.clone(),
            label_index: config.label_index.clone(),
            score_index: config.score_index.clone(),
        })
    }

    fn table_name(&self, table: Table) -> &str {
        match table {
            Table::Sessions => &self.sessions_table,
            Table::Detections => &self.detections_table,
        }
    }

    fn index_name(&self, index: Index) -> &str {
        match index {
            Index::Label => &self.label_index,
            Index::Score => &self.score_index,
        }
    }

    fn query_request(&self, query: KeyQuery) -> QueryFluentBuilder {
        let mut request = self
            .client
            .query()
            .table_name(self.table_name(query.table))
            .key_condition_expression("#pk = :pk")
            .expression_attribute_names("#pk", query.partition_key)
            .expression_attribute_values(":pk", query.partition_value);

        if let Some(index) = query.index {
            request = request.index_name(self.index_name(index));
        }

        // Global secondary indexes reject consistent reads
        if query.consistent && query.index.is_none() {
            request = request.consistent_read(true);
        }

        if let Some((sort_key, floor)) = query.sort_at_least {
            request = request
                .key_condition_expression("#pk = :pk AND #sk >= :sk")
                .expression_attribute_names("#sk", sort_key)
                .expression_attribute_values(":sk", floor);
        }

        request
    }

    /// Create whichever of the two tables is missing, with both detection
    /// indexes, and wait for them to become active
    pub async fn ensure_tables(&self) -> Result<()> {
        for table in [Table::Sessions, Table::Detections] {
            if self.table_exists(table).await? {
                debug!(table = %self.table_name(table), "Table already exists");
                continue;
            }

            info!(table = %self.table_name(table), "Creating table");
            self.create_table(table).await?;
            self.wait_until_active(table).await?;
        }
        Ok(())
    }

    async fn table_exists(&self, table: Table) -> Result<bool> {
        match self
            .client
            .describe_table()
            .table_name(self.table_name(table))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_resource_not_found_exception())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StorageError::backend("describe_table", DisplayErrorContext(e)))
                }
            }
        }
    }

    async fn create_table(&self, table: Table) -> Result<()> {
        let request = self
            .client
            .create_table()
            .table_name(self.table_name(table))
            .billing_mode(BillingMode::PayPerRequest);

        let request = match table {
            Table::Sessions => request
                .attribute_definitions(attribute(attr::UID, ScalarAttributeType::S)?)
                .key_schema(key(attr::UID, KeyType::Hash)?),
            Table::Detections => request
                .attribute_definitions(attribute(attr::PREDICTION_UID, ScalarAttributeType::S)?)
                .attribute_definitions(attribute(attr::LABEL_SCORE, ScalarAttributeType::S)?)
                .attribute_definitions(attribute(attr::LABEL, ScalarAttributeType::S)?)
                .attribute_definitions(attribute(attr::SCORE_PARTITION, ScalarAttributeType::S)?)
                .attribute_definitions(attribute(attr::SCORE, ScalarAttributeType::N)?)
                .key_schema(key(attr::PREDICTION_UID, KeyType::Hash)?)
                .key_schema(key(attr::LABEL_SCORE, KeyType::Range)?)
                .global_secondary_indexes(index(&self.label_index, attr::LABEL, attr::SCORE)?)
                .global_secondary_indexes(index(
                    &self.score_index,
                    attr::SCORE_PARTITION,
                    attr::SCORE,
                )?),
        };

        request
            .send()
            .await
            .map_err(|e| StorageError::backend("create_table", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn wait_until_active(&self, table: Table) -> Result<()> {
        for _ in 0..TABLE_READY_ATTEMPTS {
            let output = self
                .client
                .describe_table()
                .table_name(self.table_name(table))
                .send()
                .await
                .map_err(|e| StorageError::backend("describe_table", DisplayErrorContext(e)))?;

            let status = output.table().and_then(|t| t.table_status());
            if status == Some(&TableStatus::Active) {
                info!(table = %self.table_name(table), "Table active");
                return Ok(());
            }

            debug!(table = %self.table_name(table), status = ?status, "Waiting for table");
            tokio::time::sleep(TABLE_READY_INTERVAL).await;
        }

        Err(StorageError::backend(
            "create_table",
            format!("table {} did not become active", self.table_name(table)),
        ))
    }
}

fn build_error(err: aws_sdk_dynamodb::error::BuildError) -> StorageError {
    StorageError::Config(format!("invalid table definition: {err}"))
}

fn attribute(name: &str, kind: ScalarAttributeType) -> Result<AttributeDefinition> {
    AttributeDefinition::builder()
        .attribute_name(name)
        .attribute_type(kind)
        .build()
        .map_err(build_error)
}

fn key(name: &str, kind: KeyType) -> Result<KeySchemaElement> {
    KeySchemaElement::builder()
        .attribute_name(name)
        .key_type(kind)
        .build()
        .map_err(build_error)
}

fn index(name: &str, partition: &str, sort: &str) -> Result<GlobalSecondaryIndex> {
    GlobalSecondaryIndex::builder()
        .index_name(name)
        .key_schema(key(partition, KeyType::Hash)?)
        .key_schema(key(sort, KeyType::Range)?)
        .projection(
            Projection::builder()
                .projection_type(ProjectionType::All)
                .build(),
        )
        .build()
        .map_err(build_error)
}

fn table_error<E>(operation: &'static str, table: Table, err: E) -> TableError
where
    E: std::error::Error,
{
    TableError {
        operation,
        table,
        message: DisplayErrorContext(err).to_string(),
    }
}

#[async_trait]
impl ItemTables for DynamoDbTables {
    #[instrument(skip(self, item), fields(table = %table))]
    async fn put_item(&self, table: Table, item: Item) -> std::result::Result<(), TableError> {
        self.client
            .put_item()
            .table_name(self.table_name(table))
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| table_error("put_item", table, e))?;
        Ok(())
    }

    #[instrument(skip(self, key), fields(table = %table))]
    async fn get_item(
        &self,
        table: Table,
        key: Item,
    ) -> std::result::Result<Option<Item>, TableError> {
        let output = self
            .client
            .get_item()
            .table_name(self.table_name(table))
            .set_key(Some(key))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| table_error("get_item", table, e))?;

        Ok(output.item().cloned())
    }

    #[instrument(skip(self, query), fields(table = %query.table, index = ?query.index))]
    async fn query(&self, query: KeyQuery) -> std::result::Result<Vec<Item>, TableError> {
        let table = query.table;
        let request = self.query_request(query);

        let items = request
            .into_paginator()
            .items()
            .send()
            .collect::<std::result::Result<Vec<_>, _>>()
            .await
            .map_err(|e| table_error("query", table, e))?;

        debug!(count = items.len(), "Query returned items");
        Ok(items)
    }

    async fn ping(&self) -> std::result::Result<(), TableError> {
        for table in [Table::Sessions, Table::Detections] {
            if let Err(e) = self
                .client
                .describe_table()
                .table_name(self.table_name(table))
                .send()
                .await
            {
                warn!(table = %self.table_name(table), "DynamoDB table not reachable");
                return Err(table_error("describe_table", table, e));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_dynamodb::types::AttributeValue;

    #[test]
    fn test_index_definition() {
        let gsi = index("ScoreIndex", attr::SCORE_PARTITION, attr::SCORE).unwrap();
        assert_eq!(gsi.index_name(), "ScoreIndex");

        let key_schema = gsi.key_schema();
        assert_eq!(key_schema.len(), 2);
        assert_eq!(key_schema[0].attribute_name(), attr::SCORE_PARTITION);
        assert_eq!(key_schema[0].key_type(), &KeyType::Hash);
        assert_eq!(key_schema[1].attribute_name(), attr::SCORE);
        assert_eq!(key_schema[1].key_type(), &KeyType::Range);
    }

    #[tokio::test]
    async fn test_empty_region_rejected() {
        let config = DynamoDbConfig {
            region: String::new(),
            ..Default::default()
        };
        let err = DynamoDbTables::new(&config).await.err().unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_table_and_index_names() {
        let config = DynamoDbConfig {
            endpoint_url: Some("http://localhost:8000".to_string()),
            sessions_table: "sessions_dev".to_string(),
            ..Default::default()
        };
        let tables = DynamoDbTables::new(&config).await.unwrap();
        assert_eq!(tables.table_name(Table::Sessions), "sessions_dev");
        assert_eq!(tables.table_name(Table::Detections), "detection_objects");
        assert_eq!(tables.index_name(Index::Label), "LabelScoreIndex");
        assert_eq!(tables.index_name(Index::Score), "ScoreIndex");
    }

    #[tokio::test]
    async fn test_detection_read_is_consistent() {
        let config = DynamoDbConfig {
            endpoint_url: Some("http://localhost:8000".to_string()),
            ..Default::default()
        };
        let tables = DynamoDbTables::new(&config).await.unwrap();

        let by_uid = KeyQuery::partition(
            Table::Detections,
            attr::PREDICTION_UID,
            AttributeValue::S("abc".to_string()),
        )
        .consistent_read();
        let request = tables.query_request(by_uid);
        assert_eq!(request.as_input().get_consistent_read(), &Some(true));
        assert_eq!(request.as_input().get_index_name(), &None);

        // An index query never asks for a consistent read, even if flagged
        let by_label = KeyQuery::partition(
            Table::Detections,
            attr::LABEL,
            AttributeValue::S("cat".to_string()),
        )
        .on_index(Index::Label)
        .consistent_read();
        let request = tables.query_request(by_label);
        assert_eq!(request.as_input().get_consistent_read(), &None);
        assert_eq!(
            request.as_input().get_index_name(),
            &Some("LabelScoreIndex".to_string())
        );
    }
}
