use balance_forecast::history::balances_ending_at;
use balance_forecast::*;
use chrono::{Datelike, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::error::Error;
use std::result::Result;

const USER: UserId = 1;

fn ymd(y: i32, m: u32, d: u32) -> Result<NaiveDate, Box<dyn Error>> {
    NaiveDate::from_ymd_opt(y, m, d).ok_or_else(|| format!("invalid date {}-{}-{}", y, m, d).into())
}

fn sample_history() -> Result<Vec<Transaction>, Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(2024);
    let spend = Normal::<f64>::new(-28.0, 9.0)?;
    let mut rows = Vec::new();

    for day in ymd(2024, 1, 1)?.iter_days().take(120) {
        match day.day() {
            1 => rows.push(Transaction::new(day, 3100.0, "ACME PAYROLL").with_category("Salary")),
            4 => rows.push(Transaction::new(day, -1350.0, "LANDLORD").with_category("Housing")),
            18 => rows.push(
                Transaction::new(day, -52.0 - day.month() as f64, "POWER CO").with_category("Utilities"),
            ),
            _ => {}
        }
        if rng.gen_bool(0.75) {
            let amount: f64 = spend.sample(&mut rng).min(-2.0);
            rows.push(Transaction::new(day, (amount * 100.0).round() / 100.0, "CARD").with_category("Everyday"));
        }
    }

    let amounts: Vec<f64> = rows.iter().map(|t| t.amount).collect();
    for (row, balance) in rows.iter_mut().zip(balances_ending_at(&amounts, 6400.0)) {
        row.balance = Some(balance);
    }
    Ok(rows)
}

fn sample_rules() -> Result<Vec<RecurringRule>, Box<dyn Error>> {
    let mut salary = RecurringRule::new(1, "Salary", 3100.0, ymd(2024, 1, 1)?, Period::months(1));
    salary.search_strategy = SearchStrategy::from_parts("description", Some("ACME PAYROLL"))?;

    let mut rent = RecurringRule::new(2, "Rent", -1350.0, ymd(2024, 1, 4)?, Period::months(1));
    rent.search_strategy = SearchStrategy::from_parts("amount_description", Some("LANDLORD"))?;
    rent.adjust_date = true;
    rent.follow_overdue = true;

    let mut power = RecurringRule::new(3, "Electricity", -55.0, ymd(2024, 1, 18)?, Period::months(1));
    power.search_strategy = SearchStrategy::from_parts("amount<_category", Some("0,Utilities"))?;
    power.adjust_price = true;

    Ok(vec![salary, rent, power])
}

fn main() -> Result<(), Box<dyn Error>> {
    println!("📈 Balance Projection Demo");
    println!("═══════════════════════════════════════════════════════════════\n");

    let repository = InMemoryRepository::new();
    repository.insert_transactions(USER, sample_history()?);
    repository.insert_rules(USER, sample_rules()?);
    repository.insert_onetime(
        USER,
        vec![OnetimeEntry {
            id: 1,
            date: ymd(2024, 5, 25)?,
            amount: -420.0,
            description: "Flight".to_string(),
        }],
    );

    let mut registry = SessionRegistry::new(repository, ForecastConfig::default())?;
    let now = ymd(2024, 5, 1)?
        .and_hms_opt(9, 0, 0)
        .ok_or("invalid time")?;

    let report = registry.fit_model(USER, now)?;
    println!(
        "🧠 Model fitted on {} of {} transactions in {:?}\n",
        report.ml_event_count, report.event_count, report.elapsed
    );

    let end = ymd(2024, 7, 31)?;
    let projection = registry.project(USER, now, end)?;

    println!("📅 Scheduled payments");
    for event in &projection.events {
        println!(
            "   {} {:<14} {:>10.2} → {:>10.2}",
            event.occurrence.date,
            event.occurrence.label(),
            event.occurrence.amount,
            event.balance
        );
    }
    for failure in &projection.failures {
        println!("   ⚠️  rule {}: {}", failure.rule_id, failure.error);
    }

    if let Some(average) = projection.average_daily_forecast {
        println!("\n💳 Average forecast spending: {:.2} per day", average);
    }

    println!("\n💰 Balance at the end of each week");
    for (date, point) in projection
        .timeline
        .iter()
        .filter(|(d, _)| d.weekday() == chrono::Weekday::Sun)
    {
        println!("   {}  {:>10.2}", date, point.balance);
    }

    Ok(())
}
