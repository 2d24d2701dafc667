pub async fn init_pool() -> anyhow::Result<sqlx::PgPool> {
    let pg_host = std::env::var("PG_HOST").unwrap_or("localhost".to_string());
    let pg_con = std::env::var("PG_CON")
        .unwrap_or(format!("postgres://user:password@{pg_host}:5432/pg"));
    let pool = sqlx::PgPool::connect(&pg_con).await?;
    sqlx::migrate!().run(&pool).await?;
    Ok(pool)
}
