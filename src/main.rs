use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Instant;
use tempograph::db::Db;
use tempograph::extraction::adapter::parse_datetime;
use tempograph::models::EpisodeType;
use tempograph::search::{Fusion, KindSearch, PostRerank, SearchMethod};
use tempograph::services::Services;
use tempograph::store::TemporalFilter;
use tempograph::{validate_strategy, AddEpisodeOptions, Config, EpisodeInput};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "tempograph")]
#[command(about = "Bi-temporal knowledge graph: ingest episodes, resolve facts, search")]
struct Cli {
    /// Config file (overrides TEMPOGRAPH_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or upgrade the database schema
    Migrate,

    /// Ingest episodes from a JSON Lines file (one episode per line)
    Ingest {
        file: PathBuf,
        /// Group for lines without a group_id
        #[arg(short, long)]
        group: Option<String>,
        /// Only extract; park the candidates for a later `promote`
        #[arg(long)]
        extract_only: bool,
        /// Update communities after the batch (default from config)
        #[arg(long)]
        communities: bool,
    },

    /// Append text to an existing episode
    Append {
        episode: Uuid,
        /// Text to append; read from stdin when omitted
        text: Option<String>,
    },

    /// Resolve extract-only results into the graph
    Promote {
        /// Source ids to promote
        source_ids: Vec<String>,
        /// Promote every pending source of the group
        #[arg(long)]
        all: bool,
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Hybrid search
    Search {
        query: String,
        #[arg(short, long)]
        group: Option<String>,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long)]
        min_score: Option<f32>,
        /// Restrict to one result kind
        #[arg(long, value_enum)]
        kind: Option<ResultKind>,
        /// Diversify with MMR instead of plain RRF
        #[arg(long)]
        mmr: bool,
        /// Also traverse the graph from the hits
        #[arg(long)]
        bfs: bool,
        /// Rerank by graph distance from this node
        #[arg(long)]
        center: Option<Uuid>,
        /// Rerank by episode mentions
        #[arg(long)]
        mentions: bool,
        #[arg(long)]
        include_invalidated: bool,
        /// Only facts valid at this time (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        as_of: Option<String>,
    },

    /// Facts that became valid within a time window, oldest first
    Timeline {
        /// Window start, inclusive (RFC 3339 or YYYY-MM-DD)
        from: String,
        /// Window end, exclusive; defaults to now
        to: Option<String>,
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Graph counts
    Stats {
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Build or update communities
    Communities {
        #[arg(short, long)]
        group: Option<String>,
        /// Drop existing communities first
        #[arg(long)]
        rebuild: bool,
    },

    /// Remove an episode and what only it supports
    RemoveEpisode { episode: Uuid },

    /// Check the configured resolution strategy against synthetic input
    ValidateStrategy {
        /// Include community checks (writes to a throwaway group)
        #[arg(long)]
        communities: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ResultKind {
    Edges,
    Nodes,
    Episodes,
    Communities,
}

/// One JSONL episode.
#[derive(Deserialize)]
struct EpisodeLine {
    name: String,
    content: String,
    group_id: Option<String>,
    reference_time: Option<String>,
    #[serde(default)]
    source: EpisodeType,
    #[serde(default)]
    source_description: String,
    uuid: Option<Uuid>,
}

impl EpisodeLine {
    fn into_input(self, group: &str) -> Result<EpisodeInput> {
        let reference_time: DateTime<Utc> = match self.reference_time.as_deref() {
            Some(raw) => parse_datetime(raw).with_context(|| format!("invalid reference_time '{}'", raw))?,
            None => Utc::now(),
        };
        let group = self.group_id.unwrap_or_else(|| group.to_string());
        let mut input = EpisodeInput::new(self.name, self.content, group, reference_time)
            .with_source(self.source, self.source_description);
        if let Some(uuid) = self.uuid {
            input = input.with_uuid(uuid);
        }
        Ok(input)
    }
}

fn read_episodes(path: &PathBuf, group: &str) -> Result<Vec<EpisodeInput>> {
    let file = std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut episodes = Vec::new();
    for (idx, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: EpisodeLine =
            serde_json::from_str(&line).with_context(|| format!("{}:{}: invalid episode", path.display(), idx + 1))?;
        episodes.push(parsed.into_input(group)?);
    }
    Ok(episodes)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        std::env::set_var("TEMPOGRAPH_CONFIG", path);
    }

    let config = Config::load()?;
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", config.tempograph.log_level.as_str()))
        .init();

    if let Command::Migrate = cli.command {
        let db = Db::new(config.db_path());
        let applied = db.migrate(config.migrations_dir()).await?;
        for name in &applied {
            println!("✓ {}", name);
        }
        log::info!("Database {} is up to date ({} applied)", config.db_path().display(), applied.len());
        return Ok(());
    }

    let services = Services::open(config).await?;
    let default_group = services.config.tempograph.default_group_id.clone();
    let group_or_default = |group: Option<String>| group.unwrap_or_else(|| default_group.clone());

    match cli.command {
        Command::Migrate => {}

        Command::Ingest { file, group, extract_only, communities } => {
            let episodes = read_episodes(&file, &group_or_default(group))?;
            log::info!("Read {} episodes from {}", episodes.len(), file.display());
            let opts = AddEpisodeOptions { update_communities: communities.then_some(true), ..Default::default() };
            let start = Instant::now();

            if extract_only {
                for episode in episodes {
                    let name = episode.name.clone();
                    match services.ingestor.extract_only(episode, &opts).await {
                        Ok(raw) => println!("{}\t{}\t{} entities, {} facts", raw.source_id, name, raw.entity_count(), raw.edges.len()),
                        Err(e) => log::error!("✗ {}: {}", name, e),
                    }
                }
                return Ok(());
            }

            let outcomes = services.ingestor.add_episodes(episodes, &opts).await;
            let mut failed = 0;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(r) if r.skipped => println!("= {} (already ingested)", outcome.name),
                    Ok(r) => println!(
                        "✓ {} ({}): {} entities, {} facts, {} invalidated",
                        outcome.name,
                        r.episode.uuid,
                        r.nodes.len(),
                        r.edges.len(),
                        r.invalidated.len()
                    ),
                    Err(e) => {
                        failed += 1;
                        println!("✗ {}: {}", outcome.name, e);
                    }
                }
            }
            log::info!("Ingested {} episodes ({} failed) in {:?}", outcomes.len(), failed, start.elapsed());
            if failed > 0 {
                anyhow::bail!("{} episode(s) failed", failed);
            }
        }

        Command::Append { episode, text } => {
            let text = match text {
                Some(text) => text,
                None => std::io::read_to_string(std::io::stdin())?,
            };
            let result = services.ingestor.add_to_episode(episode, &text, &AddEpisodeOptions::default()).await?;
            println!(
                "✓ {}: {} entities, {} facts, {} invalidated",
                result.episode.uuid,
                result.nodes.len(),
                result.edges.len(),
                result.invalidated.len()
            );
        }

        Command::Promote { mut source_ids, all, group } => {
            if all {
                source_ids.extend(services.raw_store.list_pending(&group_or_default(group)).await?);
            }
            if source_ids.is_empty() {
                anyhow::bail!("nothing to promote: pass source ids or --all");
            }
            for source_id in source_ids {
                let result = services.ingestor.promote(&source_id, &AddEpisodeOptions::default()).await?;
                println!(
                    "✓ {} -> {}: {} entities, {} facts",
                    source_id,
                    result.source.uuid,
                    result.nodes.len(),
                    result.edges.len()
                );
            }
        }

        Command::Search {
            query,
            group,
            limit,
            min_score,
            kind,
            mmr,
            bfs,
            center,
            mentions,
            include_invalidated,
            as_of,
        } => {
            let mut per_kind = KindSearch::hybrid();
            if bfs {
                per_kind.methods.push(SearchMethod::BreadthFirst);
            }
            if mmr {
                per_kind = per_kind.with_fusion(Fusion::Mmr { lambda: services.config.search.mmr_lambda });
            }
            if let Some(center) = center {
                per_kind = per_kind.with_reranker(PostRerank::NodeDistance { center });
            }
            if mentions {
                per_kind = per_kind.with_reranker(PostRerank::EpisodeMentions);
            }

            let mut config = services.search_config();
            let selected = |k: ResultKind| match kind {
                None => Some(per_kind.clone()),
                Some(only) if only == k => Some(per_kind.clone()),
                Some(_) => None,
            };
            config.edges = selected(ResultKind::Edges);
            config.nodes = selected(ResultKind::Nodes);
            config.episodes = selected(ResultKind::Episodes);
            config.communities = selected(ResultKind::Communities);
            if let Some(limit) = limit {
                config = config.with_limit(limit);
            }
            if let Some(min_score) = min_score {
                config = config.with_min_score(min_score);
            }
            let as_of = match as_of.as_deref() {
                Some(raw) => Some(parse_datetime(raw).with_context(|| format!("invalid --as-of '{}'", raw))?),
                None => None,
            };
            config = config.with_filter(TemporalFilter { include_invalidated, as_of });

            let start = Instant::now();
            let results = services.search.search(&query, &group_or_default(group), &config).await?;
            log::info!("Search took {:?}", start.elapsed());
            print_json(&results)?;
        }

        Command::Timeline { from, to, group } => {
            let from = parse_datetime(&from).with_context(|| format!("invalid window start '{}'", from))?;
            let to = match to.as_deref() {
                Some(raw) => parse_datetime(raw).with_context(|| format!("invalid window end '{}'", raw))?,
                None => Utc::now(),
            };
            if to <= from {
                anyhow::bail!("window end must be after its start");
            }
            let facts = services.store.edges_in_range(&group_or_default(group), from, to).await?;
            for fact in &facts {
                let since = fact.valid_at.map(|t| t.to_rfc3339()).unwrap_or_default();
                let until = fact.invalid_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string());
                println!("{}\t{}\t{}\t{}", since, until, fact.name, fact.fact);
            }
            log::info!("{} facts in window", facts.len());
        }

        Command::Stats { group } => {
            let stats = services.store.stats(group.as_deref()).await?;
            print_json(&stats)?;
        }

        Command::Communities { group, rebuild } => {
            let group = group_or_default(group);
            let report = services.ingestor.build_communities(&group, rebuild).await?;
            for community in &report.communities {
                println!("{}\t{}\t{} members", community.uuid, community.name, community.member_count);
            }
            println!("{} communities written, {} entities assigned", report.communities.len(), report.assigned);
        }

        Command::RemoveEpisode { episode } => {
            let report = services.ingestor.remove_episode(episode).await?;
            print_json(&report)?;
        }

        Command::ValidateStrategy { communities } => {
            let report =
                validate_strategy(services.ingestor.strategy().as_ref(), services.store.as_ref(), communities).await?;
            print_json(&report)?;
            if !report.passed() {
                anyhow::bail!("{} strategy check(s) failed", report.violations().count());
            }
        }
    }

    Ok(())
}
