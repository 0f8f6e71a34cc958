diesel::table! {
    products (id) {
        id -> Uuid,
        name -> Varchar,
        description -> Nullable<Text>,
        price -> Numeric,
        stock -> Int4,
        reserved -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    holds (id) {
        id -> Uuid,
        product_id -> Uuid,
        quantity -> Int4,
        token -> Varchar,
        expires_at -> Timestamptz,
        used -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        product_id -> Uuid,
        hold_id -> Uuid,
        quantity -> Int4,
        total_amount -> Numeric,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    idempotency_records (key) {
        key -> Varchar,
        request_fingerprint -> Varchar,
        response_body -> Text,
        response_status -> Int4,
        expires_at -> Timestamptz,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(holds -> products (product_id));
diesel::joinable!(orders -> holds (hold_id));

diesel::allow_tables_to_appear_in_same_query!(
    products,
    holds,
    orders,
    idempotency_records,
);
