diesel::table! {
    product_variants (id) {
        id -> Uuid,
        title -> Nullable<Varchar>,
        sku -> Nullable<Varchar>,
        price -> Numeric,
        inventory_item_id -> Nullable<Int8>,
    }
}

diesel::table! {
    stock_levels (variant_id, location_id) {
        variant_id -> Uuid,
        location_id -> Int8,
        inventory_item_id -> Nullable<Int8>,
        on_hand -> Int8,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        variant_id -> Uuid,
        order_id -> Nullable<Uuid>,
        quantity -> Int4,
        status -> Varchar,
        expires_at -> Timestamptz,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        order_number -> Varchar,
        status -> Varchar,
        payment_method -> Varchar,
        total -> Numeric,
        currency -> Varchar,
        customer_name -> Varchar,
        customer_email -> Varchar,
        customer_phone -> Varchar,
        shipping_address -> Nullable<Jsonb>,
        payment_ref -> Nullable<Varchar>,
        reservations_committed_at -> Nullable<Timestamptz>,
        stock_decremented_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_items (id) {
        id -> Uuid,
        order_id -> Uuid,
        variant_id -> Uuid,
        quantity -> Int4,
        unit_price -> Numeric,
        title -> Nullable<Varchar>,
        sku -> Nullable<Varchar>,
    }
}

diesel::table! {
    webhook_events (id) {
        id -> Uuid,
        source -> Varchar,
        topic -> Varchar,
        external_id -> Varchar,
        payload_hash -> Nullable<Varchar>,
        processed_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    product_variants,
    stock_levels,
    reservations,
    orders,
    order_items,
    webhook_events,
);
