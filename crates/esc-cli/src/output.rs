use esc_domain::ConversionRecord;

/// Render the outcome of an `Engine::run` (spec §4.3 step 3: "report new
/// instance id and elapsed time").
pub fn summarize(record: &ConversionRecord) {
    match (&record.new_instance_id, record.start_time, record.end_time) {
        (Some(new_id), Some(start), Some(end)) => {
            println!(
                "{}: converted to {} in {}s",
                record.job_id,
                new_id,
                (end - start).max(0)
            );
        }
        _ => {
            let step = record
                .conversion_step
                .map(|s| s.pretty_name())
                .unwrap_or("none");
            println!(
                "{}: not complete, last step recorded is {}. Re-run to resume.",
                record.job_id, step
            );
        }
    }
}
