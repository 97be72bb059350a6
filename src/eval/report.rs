//! Console rendering of evaluation results

use super::EvaluationOutput;

fn bar(value: f64) -> String {
    let filled = (value.clamp(0.0, 1.0) * 10.0).round() as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(10 - filled))
}

pub fn print_evaluation_report(output: &EvaluationOutput) {
    let summary = &output.summary;
    let m = &summary.metrics;

    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ SUPPORT QA EVALUATION REPORT                                │");
    println!("└─────────────────────────────────────────────────────────────┘");
    println!("  source: {}", output.source);
    println!(
        "  dialogs: {} total, {} evaluated, {} unanalyzed, {} unverified\n",
        summary.total_dialogs, m.evaluated, summary.unanalyzed, summary.unverified
    );

    println!("  Intent accuracy          [{}] {:>6.2}%", bar(m.intent_accuracy), m.intent_accuracy * 100.0);
    println!(
        "  Satisfaction accuracy    [{}] {:>6.2}%",
        bar(m.satisfaction_accuracy),
        m.satisfaction_accuracy * 100.0
    );
    println!("  Quality score MAE         {:.2}", m.quality_mae);
    println!("  Quality exact match       {:.2}%", m.quality_exact_match * 100.0);
    println!("  Quality within ±1         {:.2}%", m.quality_within_one * 100.0);
    println!("  Quality correlation       {:.3}", m.quality_correlation);
    println!(
        "  Hidden dissatisfaction    {}/{} ({:.0}%)\n",
        m.hidden_dissatisfaction_detected,
        m.hidden_dissatisfaction_total,
        m.hidden_dissatisfaction_recall * 100.0
    );

    println!("  {:<25} {:>6} {:>6} {:>6}  (TP/FP/FN)", "Mistake", "Prec", "Rec", "F1");
    println!("  {} {} {} {}  {}", "-".repeat(25), "-".repeat(6), "-".repeat(6), "-".repeat(6), "-".repeat(10));
    for (mistake, mm) in &m.mistakes {
        println!(
            "  {:<25} {:>6.2} {:>6.2} {:>6.2}  ({}/{}/{})",
            mistake.as_str(),
            mm.precision,
            mm.recall,
            mm.f1,
            mm.tp,
            mm.fp,
            mm.fn_
        );
    }
    println!("  {:<25} {:>6} {:>6} {:>6.2}\n", "AVERAGE", "", "", m.mistakes_avg_f1);

    let (strengths, weaknesses) = summary.highlights();
    if !strengths.is_empty() {
        println!("✅ STRENGTHS:");
        for s in &strengths {
            println!("   • {}", s);
        }
        println!();
    }
    if !weaknesses.is_empty() {
        println!("⚠️  WEAKNESSES:");
        for w in &weaknesses {
            println!("   • {}", w);
        }
        println!();
    }
}

/// Side-by-side table when several prediction files were evaluated
pub fn print_comparison(outputs: &[EvaluationOutput]) {
    if outputs.len() < 2 {
        return;
    }

    print!("\n  {:<26}", "Metric");
    for output in outputs {
        print!(" {:>24}", output.source);
    }
    println!();
    println!("  {}", "-".repeat(26 + 25 * outputs.len()));

    let rows: [(&str, fn(&EvaluationOutput) -> f64); 6] = [
        ("intent_accuracy", |o| o.summary.metrics.intent_accuracy),
        ("satisfaction_accuracy", |o| o.summary.metrics.satisfaction_accuracy),
        ("quality_mae", |o| o.summary.metrics.quality_mae),
        ("quality_correlation", |o| o.summary.metrics.quality_correlation),
        ("hidden_dissat_recall", |o| o.summary.metrics.hidden_dissatisfaction_recall),
        ("mistakes_avg_f1", |o| o.summary.metrics.mistakes_avg_f1),
    ];
    for (label, value) in rows {
        print!("  {:<26}", label);
        for output in outputs {
            print!(" {:>24.3}", value(output));
        }
        println!();
    }
    println!();
}
