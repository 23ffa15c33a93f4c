diesel::table! {
    videos (id) {
        id -> Uuid,
        title -> Varchar,
        storage_key -> Varchar,
        status -> Varchar,
        duration_seconds -> Nullable<Int4>,
        thumbnail_key -> Nullable<Varchar>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}
