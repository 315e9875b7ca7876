use crate::metrics::AudienceMetrics;
use crate::models::{AccountBenchmarks, AudienceType, Classification, PerformanceLabel, RecommendedAction};
use crate::settings::EngineSettings;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct RuleContext {
    pub audience_type: AudienceType,
    pub age_days: i64,
    pub last_scale_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    pub benchmarks: Option<AccountBenchmarks>,
}

pub fn classify(metrics: &AudienceMetrics, settings: &EngineSettings, ctx: &RuleContext) -> Classification {
    if let Some(reason) = insufficient_data(metrics, settings, ctx) {
        return Classification::hold(PerformanceLabel::InsufficientData, format!("insufficient data: {}", reason));
    }

    if metrics.roas >= settings.winner_threshold {
        return classify_winner(metrics, settings, ctx);
    }

    let loser_threshold = match ctx.audience_type {
        AudienceType::Broad => settings.loser_threshold * settings.broad_roas_threshold_multiplier,
        _ => settings.loser_threshold,
    };
    if metrics.roas <= loser_threshold {
        return classify_loser(metrics, settings, ctx, loser_threshold);
    }

    if let Some(classification) = classify_trend(metrics, settings) {
        return classification;
    }

    Classification::hold(
        PerformanceLabel::Stable,
        format!(
            "ROAS {:.2} between loser threshold {:.2} and winner threshold {:.2}",
            metrics.roas, loser_threshold, settings.winner_threshold
        ),
    )
}

fn insufficient_data(metrics: &AudienceMetrics, settings: &EngineSettings, ctx: &RuleContext) -> Option<String> {
    let mut reasons = Vec::new();
    if metrics.spend < settings.min_spend {
        reasons.push(format!("spend {:.2} < {:.2}", metrics.spend, settings.min_spend));
    }
    if metrics.purchases < u64::from(settings.min_purchases) {
        reasons.push(format!("purchases {} < {}", metrics.purchases, settings.min_purchases));
    }
    if ctx.age_days < i64::from(settings.min_age_days) {
        reasons.push(format!("age {}d < {}d", ctx.age_days, settings.min_age_days));
    }
    if reasons.is_empty() {
        None
    } else {
        Some(reasons.join("; "))
    }
}

fn classify_winner(metrics: &AudienceMetrics, settings: &EngineSettings, ctx: &RuleContext) -> Classification {
    if let Some(hours_since) = cooldown_active(settings, ctx) {
        return Classification::hold(
            PerformanceLabel::Winner,
            format!(
                "cooldown active: last scale {:.1}h ago, cooldown is {}h",
                hours_since, settings.scale_cooldown_hours
            ),
        );
    }

    let score = weighted_score(metrics, settings, ctx.benchmarks.as_ref());
    let magnitude = scale_magnitude(score, settings, ctx.audience_type);
    if magnitude <= 0.0 {
        return Classification::hold(
            PerformanceLabel::Winner,
            format!("ROAS {:.2} qualifies but the scale cap is zero", metrics.roas),
        );
    }

    let bump = if ctx.audience_type == AudienceType::Lookalike {
        format!(" (lookalike +{}pt)", settings.lla_scale_pct_bump)
    } else {
        String::new()
    };
    Classification {
        label: PerformanceLabel::Winner,
        action: RecommendedAction::Scale,
        magnitude,
        rationale: format!(
            "ROAS {:.2} >= winner threshold {:.2}; score {:.2}; scale budget by {:.0}%{} (cap {:.0}%)",
            metrics.roas,
            settings.winner_threshold,
            score,
            magnitude,
            bump,
            scale_cap(settings, ctx.audience_type)
        ),
    }
}

fn classify_loser(
    metrics: &AudienceMetrics,
    settings: &EngineSettings,
    ctx: &RuleContext,
    threshold: f64,
) -> Classification {
    let below = format!("ROAS {:.2} <= loser threshold {:.2}", metrics.roas, threshold);
    match ctx.audience_type {
        AudienceType::Broad if ctx.age_days < i64::from(settings.broad_min_days_before_pause) => {
            Classification::hold(
                PerformanceLabel::BroadSpecialCase,
                format!(
                    "{}; broad audience is {}d old, too young to pause before {}d",
                    below, ctx.age_days, settings.broad_min_days_before_pause
                ),
            )
        }
        AudienceType::Lookalike => {
            let fatigue_spend = settings.min_spend * settings.lla_fatigue_spend_multiplier;
            if metrics.spend < fatigue_spend {
                Classification::hold(
                    PerformanceLabel::LookalikeSpecialCase,
                    format!(
                        "{}; lookalike fatigue unconfirmed until spend {:.2} reaches {:.2}",
                        below, metrics.spend, fatigue_spend
                    ),
                )
            } else {
                pause(format!("{}; lookalike fatigued after spend {:.2}", below, metrics.spend))
            }
        }
        AudienceType::Interest if metrics.declining_streak < settings.interest_days_decline_before_pause => {
            Classification::hold(
                PerformanceLabel::Loser,
                format!(
                    "{}; interest audience declining {}d of {}d required before pause",
                    below, metrics.declining_streak, settings.interest_days_decline_before_pause
                ),
            )
        }
        _ => pause(below),
    }
}

fn pause(rationale: String) -> Classification {
    Classification {
        label: PerformanceLabel::Loser,
        action: RecommendedAction::Pause,
        magnitude: 0.0,
        rationale,
    }
}

fn classify_trend(metrics: &AudienceMetrics, settings: &EngineSettings) -> Option<Classification> {
    if let Some(slope) = metrics.roas_slope {
        if slope >= settings.improving_slope {
            return Some(Classification::hold(
                PerformanceLabel::Improving,
                format!("ROAS trending up {:.3}/day (>= {:.3})", slope, settings.improving_slope),
            ));
        }
        if slope <= settings.declining_slope {
            return Some(Classification::hold(
                PerformanceLabel::Declining,
                format!("ROAS trending down {:.3}/day (<= {:.3})", slope, settings.declining_slope),
            ));
        }
    }
    match metrics.cpa_std {
        Some(std) if std >= settings.volatile_cpa_std => Some(Classification::hold(
            PerformanceLabel::Volatile,
            format!("CPA std dev {:.2} >= {:.2}", std, settings.volatile_cpa_std),
        )),
        _ => None,
    }
}

fn cooldown_active(settings: &EngineSettings, ctx: &RuleContext) -> Option<f64> {
    let last = ctx.last_scale_at?;
    let hours_since = (ctx.now - last).num_seconds() as f64 / 3600.0;
    if hours_since < f64::from(settings.scale_cooldown_hours) {
        Some(hours_since.max(0.0))
    } else {
        None
    }
}

pub fn scale_cap(settings: &EngineSettings, audience_type: AudienceType) -> f64 {
    let mut cap = f64::from(settings.max_scale_pct);
    if audience_type == AudienceType::Custom {
        cap = cap.min(f64::from(settings.custom_max_scale_pct));
    }
    cap.min(settings.max_daily_budget_increase).max(0.0)
}

pub fn scale_magnitude(score: f64, settings: &EngineSettings, audience_type: AudienceType) -> f64 {
    let base = match audience_type {
        AudienceType::Custom => f64::from(settings.custom_max_scale_pct),
        _ => f64::from(settings.max_scale_pct),
    };
    let mut computed = base * (0.5 + 0.5 * score.clamp(0.0, 1.0));
    if audience_type == AudienceType::Lookalike {
        computed += f64::from(settings.lla_scale_pct_bump);
    }
    computed.min(scale_cap(settings, audience_type)).max(0.0).floor()
}

pub fn weighted_score(
    metrics: &AudienceMetrics,
    settings: &EngineSettings,
    benchmarks: Option<&AccountBenchmarks>,
) -> f64 {
    let roas = normalized(metrics.roas - settings.winner_threshold, settings.winner_threshold);
    let spend = match benchmarks {
        Some(bench) if bench.avg_spend > 0.0 => normalized(metrics.spend, bench.avg_spend * 2.0),
        _ => normalized(metrics.spend, settings.min_spend * 4.0),
    };
    let cvr = match benchmarks {
        Some(bench) if bench.avg_cvr > 0.0 => normalized(metrics.cvr, bench.avg_cvr * 2.0),
        _ => 0.5,
    };
    let volume = normalized(metrics.purchases as f64, f64::from(settings.min_purchases) * 4.0);

    let weights = [
        (settings.roas_weight.max(0.0), roas),
        (settings.spend_weight.max(0.0), spend),
        (settings.cvr_weight.max(0.0), cvr),
        (settings.volume_weight.max(0.0), volume),
    ];
    let total = weights.iter().map(|(weight, _)| weight).sum::<f64>();
    if total <= 0.0 {
        return 0.0;
    }
    weights.iter().map(|(weight, value)| weight * value).sum::<f64>() / total
}

fn normalized(value: f64, reference: f64) -> f64 {
    if reference <= 0.0 {
        return if value > 0.0 { 1.0 } else { 0.0 };
    }
    (value / reference).clamp(0.0, 1.0)
}
