use std::{process, sync::Arc};

use apalis::{
    layers::{WorkerBuilderExt, retry::RetryPolicy as JobRetryPolicy},
    prelude::{Monitor, WorkerBuilder, WorkerFactoryFn},
};
use apalis_sql::{Config as ApalisSqlConfig, postgres::PostgresStorage};
use feedline::{
    application::{
        error::AppError,
        fanout::{BatchFanoutWorker, FanoutCoordinator, FanoutSettings},
        jobs::{JobWorkerContext, process_fanout_batch_job, process_fanout_post_job},
        pagination::FeedQuery,
        repos::{CountsRepo, FeedEntriesRepo, FollowershipDirectory, JobsRepo, ObjectStore},
        timeline::{FeedHydrator, TimelineService},
    },
    cache::{CacheConfig, CounterCache, FeedCache, FollowingsCache, KvStore, ObjectCache},
    config,
    domain::types::JobType,
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, OpsState},
        telemetry,
    },
};
use tokio::{net::TcpListener, signal, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Fanout(args) => run_fanout(settings, args).await,
        config::Command::Timeline(args) => run_timeline(settings, args).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let pool = connect_pool(&settings, settings.database.max_connections.get()).await?;
    prepare_database(&pool).await?;
    let repositories = Arc::new(PostgresRepositories::new(pool));
    let job_repositories = Arc::new(PostgresRepositories::new(
        connect_pool(&settings, settings.database.jobs_max_connections.get()).await?,
    ));

    let pipeline = Pipeline::build(job_repositories.clone(), &settings);
    let job_context = JobWorkerContext {
        coordinator: pipeline.coordinator.clone(),
        worker: pipeline.worker.clone(),
        job_timeout: settings.jobs.job_timeout,
    };
    let monitor = build_job_monitor(&job_repositories, job_context, &settings)
        .shutdown_timeout(settings.server.graceful_shutdown);

    let ops_state = OpsState {
        db: repositories,
        kv: pipeline.kv.clone(),
    };
    let listener = TcpListener::bind(settings.server.ops_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "feedline::serve",
        addr = %settings.server.ops_addr,
        "Ops listener ready"
    );

    let server = async {
        axum::serve(listener, http::build_ops_router(ops_state).into_make_service())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|err| AppError::unexpected(format!("server error: {err}")))
    };
    let workers = async {
        monitor
            .run_with_signal(signal::ctrl_c())
            .await
            .map_err(|err| AppError::from(InfraError::job_queue(err.to_string())))
    };

    let result = try_join!(server, workers).map(|_| ());

    pipeline.kv.close();
    info!(target = "feedline::serve", "Shutdown complete");
    result
}

async fn run_fanout(settings: config::Settings, args: config::FanoutArgs) -> Result<(), AppError> {
    let pool = connect_pool(&settings, settings.database.max_connections.get()).await?;
    let pipeline = Pipeline::build(Arc::new(PostgresRepositories::new(pool)), &settings);

    let ticket = pipeline
        .coordinator
        .fanout(args.post_id, args.author_id)
        .await?;

    info!(
        target = "feedline::fanout",
        post_id = %args.post_id,
        author_id = %args.author_id,
        job_id = %ticket.job_id,
        "Fanout enqueued"
    );
    Ok(())
}

async fn run_timeline(
    settings: config::Settings,
    args: config::TimelineArgs,
) -> Result<(), AppError> {
    let pool = connect_pool(&settings, settings.database.max_connections.get()).await?;
    let pipeline = Pipeline::build(Arc::new(PostgresRepositories::new(pool)), &settings);

    let query = FeedQuery::from_params(
        args.before.as_deref(),
        args.after.as_deref(),
        args.size.as_deref(),
        pipeline.timeline.limits(),
    )
    .map_err(|err| AppError::validation(err.to_string()))?;

    let rendered = if args.hydrate {
        let page = pipeline
            .timeline
            .page_hydrated(args.subscriber_id, query, &pipeline.hydrator)
            .await?;
        serde_json::to_string_pretty(&page)
    } else {
        let page = pipeline.timeline.page(args.subscriber_id, query).await?;
        serde_json::to_string_pretty(&page)
    }
    .map_err(|err| AppError::unexpected(format!("failed to render page: {err}")))?;

    println!("{rendered}");
    Ok(())
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let pool = connect_pool(&settings, 1).await?;
    prepare_database(&pool).await?;
    info!(target = "feedline::migrate", "Migrations applied");
    Ok(())
}

async fn connect_pool(
    settings: &config::Settings,
    max_connections: u32,
) -> Result<sqlx::PgPool, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    PostgresRepositories::connect(database_url, max_connections)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))
}

async fn prepare_database(pool: &sqlx::PgPool) -> Result<(), AppError> {
    PostgresRepositories::run_migrations(pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;
    PostgresRepositories::setup_job_queue(pool)
        .await
        .map_err(|err| AppError::from(InfraError::job_queue(err.to_string())))
}

/// Services wired over one repository handle and one process-local cache.
struct Pipeline {
    kv: Arc<KvStore>,
    coordinator: Arc<FanoutCoordinator>,
    worker: Arc<BatchFanoutWorker>,
    timeline: TimelineService,
    hydrator: FeedHydrator,
}

impl Pipeline {
    fn build(repositories: Arc<PostgresRepositories>, settings: &config::Settings) -> Self {
        let feed_entries: Arc<dyn FeedEntriesRepo> = repositories.clone();
        let directory: Arc<dyn FollowershipDirectory> = repositories.clone();
        let objects: Arc<dyn ObjectStore> = repositories.clone();
        let counts: Arc<dyn CountsRepo> = repositories.clone();
        let jobs: Arc<dyn JobsRepo> = repositories;

        let cache_config = CacheConfig::from(&settings.cache);
        let fanout_settings = FanoutSettings::from(&settings.fanout);

        let kv = Arc::new(KvStore::open(&cache_config));
        let feed_cache = Arc::new(FeedCache::new(kv.clone(), &cache_config));
        let object_cache = Arc::new(ObjectCache::new(kv.clone()));
        let counters = Arc::new(CounterCache::new(kv.clone()));
        let followings = Arc::new(FollowingsCache::new(kv.clone()));

        let coordinator = Arc::new(FanoutCoordinator::new(
            feed_entries.clone(),
            directory.clone(),
            objects.clone(),
            object_cache.clone(),
            feed_cache.clone(),
            jobs,
            fanout_settings,
        ));
        let worker = Arc::new(BatchFanoutWorker::new(
            feed_entries.clone(),
            objects.clone(),
            object_cache.clone(),
            feed_cache.clone(),
            fanout_settings.store_retry,
        ));
        let timeline = TimelineService::new(feed_entries, feed_cache, cache_config.page_limits());
        let hydrator = FeedHydrator::new(
            objects,
            object_cache,
            counts,
            counters,
            directory,
            followings,
        );

        Self {
            kv,
            coordinator,
            worker,
            timeline,
            hydrator,
        }
    }
}

fn build_job_monitor(
    repositories: &PostgresRepositories,
    context: JobWorkerContext,
    settings: &config::Settings,
) -> Monitor {
    let fanout_post_storage = PostgresStorage::new_with_config(
        repositories.pool().clone(),
        ApalisSqlConfig::new(JobType::FanoutPost.as_str()),
    );
    let fanout_batch_storage = PostgresStorage::new_with_config(
        repositories.pool().clone(),
        ApalisSqlConfig::new(JobType::FanoutBatch.as_str()),
    );

    let retries = settings.fanout.job_max_attempts.get().saturating_sub(1) as usize;
    let fanout_post_concurrency = settings.jobs.fanout_post_concurrency.get() as usize;
    let fanout_batch_concurrency = settings.jobs.fanout_batch_concurrency.get() as usize;

    let fanout_post_worker = WorkerBuilder::new("fanout-post-worker")
        .retry(JobRetryPolicy::retries(retries))
        .concurrency(fanout_post_concurrency)
        .data(context.clone())
        .backend(fanout_post_storage)
        .build_fn(process_fanout_post_job);
    let fanout_batch_worker = WorkerBuilder::new("fanout-batch-worker")
        .retry(JobRetryPolicy::retries(retries))
        .concurrency(fanout_batch_concurrency)
        .data(context)
        .backend(fanout_batch_storage)
        .build_fn(process_fanout_batch_job);

    Monitor::new()
        .register(fanout_post_worker)
        .register(fanout_batch_worker)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}
