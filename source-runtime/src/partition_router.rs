//! Partition routers: where the partitions of a stream come from.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use tributary::error::{Result, SourceError};
use tributary::{StreamSlice, SyncMode};

use crate::interpolation::Template;
use crate::requester::{RequestOption, RequestOptions};
use crate::stream::{DeclarativeStream, ReadContext};

pub trait PartitionRouter: Send + Sync + fmt::Debug {
    /// Partitions of `stream`, in order. `parent_state` is the
    /// `parent_state` entry of the stream's incoming checkpoint.
    fn partitions(
        &self,
        read: Arc<ReadContext>,
        stream: &str,
        parent_state: Option<Value>,
    ) -> BoxStream<'static, Result<StreamSlice>>;

    fn request_options(&self, _slice: &StreamSlice) -> RequestOptions {
        RequestOptions::default()
    }

    fn is_substream(&self) -> bool {
        false
    }
}

/// One partition per value: `{cursor_field: value}`.
#[derive(Debug, Clone)]
pub struct ListPartitionRouter {
    pub values: Template,
    pub cursor_field: String,
    pub request_option: Option<RequestOption>,
    pub parameters: Value,
}

impl ListPartitionRouter {
    fn values(&self, read: &ReadContext) -> Result<Vec<Value>> {
        let ctx = read.template_context(&self.parameters);
        Ok(match self.values.eval(&ctx)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            Value::String(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Array(items)) => items,
                _ => text
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            },
            other => vec![other],
        })
    }
}

impl PartitionRouter for ListPartitionRouter {
    fn partitions(
        &self,
        read: Arc<ReadContext>,
        _stream: &str,
        _parent_state: Option<Value>,
    ) -> BoxStream<'static, Result<StreamSlice>> {
        let values = match self.values(&read) {
            Ok(values) => values,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let slices: Vec<Result<StreamSlice>> = values
            .into_iter()
            .map(|value| {
                let mut partition = Map::new();
                partition.insert(self.cursor_field.clone(), value);
                Ok(StreamSlice::from_partition(partition))
            })
            .collect();
        stream::iter(slices).boxed()
    }

    fn request_options(&self, slice: &StreamSlice) -> RequestOptions {
        let mut options = RequestOptions::default();
        if let (Some(option), Some(value)) = (&self.request_option, slice.partition.get(&self.cursor_field)) {
            options.inject(option, value.clone());
        }
        options
    }
}

/// How a child stream derives partitions from one parent stream.
#[derive(Debug, Clone)]
pub struct ParentStreamConfig {
    pub stream: Arc<DeclarativeStream>,
    pub parent_key: String,
    pub partition_field: String,
    pub request_option: Option<RequestOption>,
    /// Read the parent incrementally and keep its state in the child's
    pub incremental_dependency: bool,
}

/// One partition per parent record:
/// `{partition_field: record[parent_key], parent_slice: parent partition}`.
#[derive(Debug, Clone)]
pub struct SubstreamPartitionRouter {
    pub parents: Vec<ParentStreamConfig>,
}

impl PartitionRouter for SubstreamPartitionRouter {
    fn partitions(
        &self,
        read: Arc<ReadContext>,
        stream: &str,
        parent_state: Option<Value>,
    ) -> BoxStream<'static, Result<StreamSlice>> {
        let buffer = read.runtime().reader.output_buffer.max(1);
        let (tx, rx) = mpsc::channel(buffer);
        let parents = self.parents.clone();
        let child = stream.to_string();

        tokio::spawn(async move {
            for parent in &parents {
                let saved = parent_state
                    .as_ref()
                    .and_then(|s| s.get(&parent.stream.name))
                    .cloned();
                if let Err(e) = read_parent(&read, &child, parent, saved, &tx).await {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        });
        ReceiverStream::new(rx).boxed()
    }

    fn request_options(&self, slice: &StreamSlice) -> RequestOptions {
        let mut options = RequestOptions::default();
        for parent in &self.parents {
            if let (Some(option), Some(value)) =
                (&parent.request_option, slice.partition.get(&parent.partition_field))
            {
                options.inject(option, value.clone());
            }
        }
        options
    }

    fn is_substream(&self) -> bool {
        true
    }
}

async fn read_parent(
    read: &Arc<ReadContext>,
    child: &str,
    config: &ParentStreamConfig,
    saved_state: Option<Value>,
    tx: &mpsc::Sender<Result<StreamSlice>>,
) -> Result<()> {
    let parent = &config.stream;
    let mode = if config.incremental_dependency {
        SyncMode::Incremental
    } else {
        SyncMode::FullRefresh
    };
    info!(stream = %child, parent = %parent.name, mode = ?mode, "Reading parent stream");

    let mut open = parent.open(read.clone(), mode, saved_state.as_ref())?;
    let mut partitions = open.partitions();
    let mut emitted: u64 = 0;

    while let Some(partition) = partitions.next().await {
        let partition = partition?;
        for slice in open.cursor.stream_slices(&partition)? {
            if open.run.is_timezone_mismatched() {
                break;
            }
            let stream_state = open.cursor.template_state(&slice);
            let mut reader = open.run.slice_reader(slice.clone(), stream_state)?;
            while let Some(records) = reader.next_page().await? {
                for record in records {
                    let key = match record.data.get(&config.parent_key) {
                        Some(Value::Null) | None => {
                            warn!(
                                stream = %child,
                                parent = %parent.name,
                                parent_key = %config.parent_key,
                                "Skipping parent record without key"
                            );
                            continue;
                        }
                        Some(key) => key.clone(),
                    };
                    let mut child_partition = Map::new();
                    child_partition.insert(config.partition_field.clone(), key);
                    child_partition.insert(
                        "parent_slice".into(),
                        Value::Object(record.associated_slice.partition.clone()),
                    );
                    if tx.send(Ok(StreamSlice::from_partition(child_partition))).await.is_err() {
                        debug!(stream = %child, "Partition consumer went away");
                        return Ok(());
                    }
                    emitted += 1;
                }
            }
            open.cursor.close_partition(&slice, reader.outcome().most_recent)?;
        }
    }
    if open.run.is_timezone_mismatched() {
        return Err(open.run.timezone_error());
    }

    if config.incremental_dependency {
        open.absorb_parent_state();
        if let Some(state) = open.cursor.state() {
            read.record_parent_state(child, &parent.name, state);
        }
    }
    debug!(stream = %child, parent = %parent.name, partitions = emitted, "Parent stream done");
    Ok(())
}

/// Cartesian product of several routers, in declared order.
#[derive(Debug, Clone)]
pub struct CartesianProductRouter {
    pub routers: Vec<Arc<dyn PartitionRouter>>,
}

impl PartitionRouter for CartesianProductRouter {
    fn partitions(
        &self,
        read: Arc<ReadContext>,
        stream: &str,
        parent_state: Option<Value>,
    ) -> BoxStream<'static, Result<StreamSlice>> {
        let routers = self.routers.clone();
        let stream = stream.to_string();
        let product = async move {
            let mut product = vec![StreamSlice::default()];
            for router in &routers {
                let parts: Vec<StreamSlice> = router
                    .partitions(read.clone(), &stream, parent_state.clone())
                    .try_collect()
                    .await?;
                product = product
                    .iter()
                    .flat_map(|left| parts.iter().map(move |right| combine(left, right)))
                    .collect();
            }
            Ok::<_, SourceError>(stream::iter(product.into_iter().map(Ok::<_, SourceError>)))
        };
        stream::once(product).try_flatten().boxed()
    }

    fn request_options(&self, slice: &StreamSlice) -> RequestOptions {
        let mut options = RequestOptions::default();
        for router in &self.routers {
            options.merge(&router.request_options(slice));
        }
        options
    }

    fn is_substream(&self) -> bool {
        self.routers.iter().any(|r| r.is_substream())
    }
}

fn combine(left: &StreamSlice, right: &StreamSlice) -> StreamSlice {
    let mut partition = left.partition.clone();
    partition.extend(right.partition.clone());
    let mut extra_fields = left.extra_fields.clone();
    extra_fields.extend(right.extra_fields.clone());
    StreamSlice {
        partition,
        cursor_slice: Map::new(),
        extra_fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requester::InjectInto;
    use crate::testing::read_context;
    use serde_json::json;

    fn list(values: Value, field: &str) -> ListPartitionRouter {
        ListPartitionRouter {
            values: Template::compile(&values).unwrap(),
            cursor_field: field.into(),
            request_option: Some(RequestOption {
                field_name: field.into(),
                inject_into: InjectInto::RequestParameter,
            }),
            parameters: json!({}),
        }
    }

    async fn collect(router: &dyn PartitionRouter) -> Vec<Value> {
        router
            .partitions(read_context(json!({"regions": ["eu", "us"]})), "s", None)
            .map_ok(|slice| Value::Object(slice.partition))
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_router_values_from_config() {
        let router = list(json!("{{ config.regions }}"), "region");
        assert_eq!(collect(&router).await, vec![json!({"region": "eu"}), json!({"region": "us"})]);

        let slice = StreamSlice::from_partition(json!({"region": "eu"}).as_object().cloned().unwrap());
        assert_eq!(Value::Object(router.request_options(&slice).params), json!({"region": "eu"}));
    }

    #[tokio::test]
    async fn test_cartesian_product_in_declared_order() {
        let router = CartesianProductRouter {
            routers: vec![
                Arc::new(list(json!(["a", "b"]), "letter")),
                Arc::new(list(json!([1, 2]), "digit")),
            ],
        };
        assert_eq!(
            collect(&router).await,
            vec![
                json!({"letter": "a", "digit": 1}),
                json!({"letter": "a", "digit": 2}),
                json!({"letter": "b", "digit": 1}),
                json!({"letter": "b", "digit": 2}),
            ]
        );
        assert!(!router.is_substream());
    }
}
