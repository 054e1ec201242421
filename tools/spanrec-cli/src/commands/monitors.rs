//! Print the monitor layout in virtual desktop coordinates.

use spanrec_capture_engine::get_backend;
use spanrec_platform_core::DisplayTopology;

pub fn run(json: bool) -> anyhow::Result<()> {
    let backend = get_backend()?;
    let topology = DisplayTopology::from_monitors(backend.detect_monitors()?)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&topology)?);
        return Ok(());
    }

    println!("Virtual desktop: {}", topology.bounds());
    for (index, monitor) in topology.monitors().iter().enumerate() {
        println!(
            "  [{index}] {:<12} {}{}",
            monitor.id,
            monitor.rect,
            if monitor.is_primary { " (primary)" } else { "" }
        );
    }
    println!();
    println!("Record one with `spanrec record --monitor <name|index>`,");
    println!("or any area with `spanrec record --region X,Y,W,H`.");
    Ok(())
}
