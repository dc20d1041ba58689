// Diesel schema shared by every backend. Ids and JSON documents are stored as
// text, timestamps as microseconds since the epoch.
use diesel::allow_tables_to_appear_in_same_query;
diesel::table! {
    identities (id) {
        id -> Text,
        schema_id -> Text,
        traits -> Text,
        state -> Text,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}
diesel::table! {
    identity_verifiable_addresses (id) {
        id -> Text,
        identity_id -> Text,
        value -> Text,
        via -> Text,
        status -> Text,
        verified -> Bool,
        verified_at -> Nullable<BigInt>,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}
diesel::table! {
    identity_recovery_addresses (id) {
        id -> Text,
        identity_id -> Text,
        value -> Text,
        via -> Text,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}
diesel::table! {
    sessions (id) {
        id -> Text,
        identity_id -> Text,
        active -> Bool,
        issued_at -> BigInt,
        expires_at -> BigInt,
        authenticated_at -> BigInt,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}
diesel::table! {
    selfservice_flows (id) {
        id -> Text,
        flow_type -> Text,
        request_url -> Text,
        issued_at -> BigInt,
        expires_at -> BigInt,
        active_method -> Nullable<Text>,
        csrf_token -> Text,
        status -> Text,
        ui -> Text,
        methods -> Text,
        identity_id -> Nullable<Text>,
        version -> BigInt,
        created_at -> BigInt,
        updated_at -> BigInt,
        state -> Text,
    }
}
diesel::table! {
    identity_recovery_tokens (id) {
        id -> Text,
        token -> Text,
        flow_id -> Text,
        recovery_address_id -> Text,
        issued_at -> BigInt,
        expires_at -> BigInt,
        used -> Bool,
        used_at -> Nullable<BigInt>,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}
diesel::table! {
    identity_verification_tokens (id) {
        id -> Text,
        token -> Text,
        flow_id -> Text,
        verifiable_address_id -> Text,
        issued_at -> BigInt,
        expires_at -> BigInt,
        used -> Bool,
        used_at -> Nullable<BigInt>,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}
allow_tables_to_appear_in_same_query!(identities,
                                      identity_verifiable_addresses,
                                      identity_recovery_addresses,
                                      sessions,
                                      selfservice_flows,
                                      identity_recovery_tokens,
                                      identity_verification_tokens);
