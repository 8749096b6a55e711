use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, from_document, to_document, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{
    FindOneAndUpdateOptions, FindOneOptions, FindOptions, IndexOptions, InsertManyOptions,
    ReturnDocument,
};
use mongodb::{Client, Collection, IndexModel};

use sonde_core::{NodeId, Record};

use super::{InsertOutcome, SeriesRange, SeriesStore};

const SERIES_COLLECTION: &str = "timeseries";
const COUNTERS_COLLECTION: &str = "counters";

/// Mongo server error code for a unique-index violation.
const DUPLICATE_KEY: i32 = 11000;

#[derive(Debug, thiserror::Error)]
pub enum MongoSeriesError {
    #[error("MongoDB driver error: {0}")]
    Driver(#[from] mongodb::error::Error),

    #[error("record serialization failed: {0}")]
    Encode(#[from] mongodb::bson::ser::Error),

    #[error("record deserialization failed: {0}")]
    Decode(#[from] mongodb::bson::de::Error),

    #[error("counter update returned no document for node {0}")]
    MissingCounter(NodeId),
}

/// MongoDB-backed series store: records in `timeseries`, one counter
/// document per node in `counters`.
#[derive(Clone)]
pub struct MongoSeriesStore {
    series: Collection<Document>,
    counters: Collection<Document>,
}

impl MongoSeriesStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, MongoSeriesError> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(database);
        let store = Self {
            series: db.collection(SERIES_COLLECTION),
            counters: db.collection(COUNTERS_COLLECTION),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    /// `{nodeId, ts}` for window queries, unique `{nodeId, seq}` so a
    /// replayed batch cannot double-write a sequence.
    async fn ensure_indexes(&self) -> Result<(), MongoSeriesError> {
        self.series
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"nodeId": 1, "ts": 1})
                    .build(),
                None,
            )
            .await?;
        self.series
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"nodeId": 1, "seq": 1})
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
                None,
            )
            .await?;
        Ok(())
    }

    fn node_filter(node: &NodeId) -> Document {
        doc! {"nodeId": node.as_str()}
    }

    async fn find_records(
        &self,
        filter: Document,
        options: FindOptions,
    ) -> Result<Vec<Record>, MongoSeriesError> {
        let mut cursor = self.series.find(filter, options).await?;
        let mut records = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            records.push(from_document(document)?);
        }
        Ok(records)
    }
}

/// Sequences live in BSON as Int64; clamp open-ended u64 bounds.
fn seq_bson(seq: u64) -> i64 {
    seq.min(i64::MAX as u64) as i64
}

/// An unordered insert surfaces all write errors at once; if every one of
/// them is a duplicate key, the batch as a whole still succeeded.
fn duplicates_only(err: &mongodb::error::Error, total: u64) -> Option<InsertOutcome> {
    if let ErrorKind::BulkWrite(failure) = &*err.kind {
        if let Some(write_errors) = &failure.write_errors {
            if !write_errors.is_empty() && write_errors.iter().all(|we| we.code == DUPLICATE_KEY)
            {
                let duplicates = write_errors.len() as u64;
                return Some(InsertOutcome {
                    inserted: total - duplicates,
                    duplicates,
                });
            }
        }
    }
    None
}

#[async_trait]
impl SeriesStore for MongoSeriesStore {
    type Error = MongoSeriesError;

    async fn allocate_seq(&self, node: &NodeId, count: u64) -> Result<u64, Self::Error> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let updated = self
            .counters
            .find_one_and_update(
                doc! {"_id": node.as_str()},
                doc! {"$inc": {"seq": count as i64}},
                options,
            )
            .await?;

        let document = updated.ok_or_else(|| MongoSeriesError::MissingCounter(node.clone()))?;
        match document.get("seq") {
            Some(Bson::Int64(top)) => Ok(*top as u64),
            Some(Bson::Int32(top)) => Ok(*top as u64),
            Some(Bson::Double(top)) => Ok(*top as u64),
            _ => Err(MongoSeriesError::MissingCounter(node.clone())),
        }
    }

    async fn insert_records(&self, records: Vec<Record>) -> Result<InsertOutcome, Self::Error> {
        if records.is_empty() {
            return Ok(InsertOutcome::default());
        }
        let total = records.len() as u64;
        let documents = records
            .iter()
            .map(to_document)
            .collect::<Result<Vec<_>, _>>()?;

        let options = InsertManyOptions::builder().ordered(false).build();
        match self.series.insert_many(documents, options).await {
            Ok(result) => Ok(InsertOutcome {
                inserted: result.inserted_ids.len() as u64,
                duplicates: 0,
            }),
            Err(err) => match duplicates_only(&err, total) {
                Some(outcome) => Ok(outcome),
                None => Err(err.into()),
            },
        }
    }

    async fn query(
        &self,
        node: &NodeId,
        range: SeriesRange,
        limit: usize,
    ) -> Result<Vec<Record>, Self::Error> {
        let mut filter = Self::node_filter(node);
        match range {
            SeriesRange::Ts { from, to } => {
                filter.insert("ts", doc! {"$gte": from, "$lte": to});
            }
            SeriesRange::Seq { from, to } => {
                filter.insert("seq", doc! {"$gte": seq_bson(from), "$lte": seq_bson(to)});
            }
        }
        let options = FindOptions::builder()
            .sort(doc! {"seq": 1})
            .limit(limit as i64)
            .build();
        self.find_records(filter, options).await
    }

    async fn latest(&self, node: &NodeId) -> Result<Option<Record>, Self::Error> {
        let options = FindOneOptions::builder().sort(doc! {"seq": -1}).build();
        let document = self
            .series
            .find_one(Self::node_filter(node), options)
            .await?;
        document
            .map(from_document)
            .transpose()
            .map_err(MongoSeriesError::from)
    }

    async fn since_seq(&self, node: &NodeId, last_seq: u64) -> Result<Vec<Record>, Self::Error> {
        let mut filter = Self::node_filter(node);
        filter.insert("seq", doc! {"$gt": seq_bson(last_seq)});
        let options = FindOptions::builder().sort(doc! {"seq": 1}).build();
        self.find_records(filter, options).await
    }

    async fn count(&self, node: &NodeId) -> Result<u64, Self::Error> {
        Ok(self
            .series
            .count_documents(Self::node_filter(node), None)
            .await?)
    }
}
