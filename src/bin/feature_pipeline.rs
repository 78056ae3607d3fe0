use engagement_features::{
    compute_features, engine_config_from_env, export_table, finalize, init_logging,
    load_clicks, load_impressions, load_payments, log_inputs_selected, log_pipeline_finish,
    log_pipeline_start, logging_config_from_env, pipeline_paths_from_env, ExportTable,
    FinalizeConfig,
};
use tokio::task::spawn_blocking;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let engine_cfg = engine_config_from_env()?;
    let paths = pipeline_paths_from_env()?;
    log_pipeline_start(&logging_cfg, &engine_cfg);
    log_inputs_selected(&paths);

    // The three streams are independent; load them side by side.
    let impressions_path = paths.impressions.clone();
    let clicks_path = paths.clicks.clone();
    let payments_path = paths.payments.clone();
    let (impressions, clicks, payments) = tokio::try_join!(
        spawn_blocking(move || load_impressions(&impressions_path)),
        spawn_blocking(move || load_clicks(&clicks_path)),
        spawn_blocking(move || load_payments(&payments_path)),
    )?;
    let (impressions, _) = impressions?;
    let (clicks, _) = clicks?;
    let (payments, _) = payments?;

    let features = compute_features(impressions, clicks, payments, &engine_cfg).await?;
    let (table, report) = finalize(
        ExportTable::from_features(&features),
        &FinalizeConfig::default(),
    );
    export_table(&table, &paths.output, paths.format)?;

    log_pipeline_finish(&paths, &report, table.rows.len());
    Ok(())
}
