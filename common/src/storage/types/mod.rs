use std::fmt;

use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use surrealdb::sql::Thing;

pub mod document;
pub mod project;

/// A row that lives in its own SurrealDB table, keyed by a string id.
pub trait StoredObject: Serialize + DeserializeOwned {
    const TABLE: &'static str;

    fn id(&self) -> &str;
}

/// SurrealDB hands record ids back as `Thing`s while our own writes store
/// plain strings; id columns accept either shape.
struct RecordIdVisitor;

impl<'de> de::Visitor<'de> for RecordIdVisitor {
    type Value = String;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a record id as a string or a Thing")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(value.to_owned())
    }

    fn visit_map<A>(self, access: A) -> Result<Self::Value, A::Error>
    where
        A: de::MapAccess<'de>,
    {
        let thing = Thing::deserialize(de::value::MapAccessDeserializer::new(access))?;
        Ok(thing.id.to_raw())
    }
}

pub fn deserialize_record_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(RecordIdVisitor)
}

/// `chrono` timestamps cross the wire as native SurrealDB datetimes.
pub mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use surrealdb::sql::Datetime as SqlDatetime;

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        SqlDatetime::from(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(SqlDatetime::deserialize(deserializer)?.into())
    }
}

/// Optional variant of [`surreal_datetime`] for columns like
/// `processing_started_at` that are unset until a phase runs.
pub mod surreal_opt_datetime {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use surrealdb::sql::Datetime as SqlDatetime;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.map(SqlDatetime::from).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<SqlDatetime>::deserialize(deserializer)?;
        Ok(value.map(DateTime::<Utc>::from))
    }
}

/// Declares a stored row type: the shared `id`/`created_at`/`updated_at`
/// columns followed by the table's own fields, wired into [`StoredObject`].
macro_rules! stored_object {
    ($name:ident, $table:literal, { $($(#[$attr:meta])* $field:ident: $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
        pub struct $name {
            #[serde(deserialize_with = "crate::storage::types::deserialize_record_id")]
            pub id: String,
            #[serde(with = "crate::storage::types::surreal_datetime", default)]
            pub created_at: chrono::DateTime<chrono::Utc>,
            #[serde(with = "crate::storage::types::surreal_datetime", default)]
            pub updated_at: chrono::DateTime<chrono::Utc>,
            $( $(#[$attr])* pub $field: $ty, )*
        }

        impl crate::storage::types::StoredObject for $name {
            const TABLE: &'static str = $table;

            fn id(&self) -> &str {
                &self.id
            }
        }
    };
}

pub(crate) use stored_object;
