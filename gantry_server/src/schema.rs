//! Diesel table definitions for the preview environment platform.
//!
//! Tables: projects, clusters, environments, deployments, infras.
//! All tables include tenant_id for multi-tenancy via RLS.

diesel::table! {
    projects (id) {
        id -> Int8,
        tenant_id -> Uuid,
        name -> Varchar,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    clusters (id) {
        id -> Int8,
        tenant_id -> Uuid,
        project_id -> Int8,
        name -> Varchar,
        provider -> Nullable<Varchar>,
        api_server_url -> Varchar,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    environments (id) {
        id -> Int8,
        tenant_id -> Uuid,
        project_id -> Int8,
        cluster_id -> Int8,
        installation_id -> Int8,
        repo_owner -> Varchar,
        repo_name -> Varchar,
        name -> Varchar,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    deployments (id) {
        id -> Int8,
        tenant_id -> Uuid,
        environment_id -> Int8,
        namespace -> Varchar,
        status -> Varchar,
        subdomain -> Varchar,
        repo_owner -> Varchar,
        repo_name -> Varchar,
        pr_number -> Int4,
        branch -> Varchar,
        commit_sha -> Varchar,
        gh_deployment_id -> Int8,
        version -> Int4,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    infras (id) {
        id -> Int8,
        tenant_id -> Uuid,
        project_id -> Int8,
        kind -> Varchar,
        status -> Varchar,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}
