//! Check system capabilities.

use spanrec_capture_engine::get_backend;
use spanrec_platform_core::DisplayTopology;
use spanrec_platform_linux::permissions::{
    all_required_available, check_capabilities, print_capability_report,
};
use spanrec_platform_linux::{detect_display_server, DisplayServer};

pub fn run() -> anyhow::Result<()> {
    println!("Spanrec System Check");
    println!("{}", "=".repeat(50));

    match detect_display_server() {
        DisplayServer::X11 => println!("[OK] Display server: X11"),
        DisplayServer::Wayland => println!("[WARN] Display server: Wayland (XWayland only)"),
        _ => println!("[WARN] Display server: Unknown"),
    }

    let monitors = get_backend()
        .and_then(|backend| backend.detect_monitors())
        .and_then(DisplayTopology::from_monitors);
    match monitors {
        Ok(topology) => {
            println!(
                "[OK] Monitors detected: {} (desktop {})",
                topology.monitors().len(),
                topology.bounds()
            );
            for m in topology.monitors() {
                println!(
                    "     {} {} {}",
                    m.id,
                    m.rect,
                    if m.is_primary { "(primary)" } else { "" }
                );
            }
        }
        Err(e) => println!("[MISSING] Monitors: {e}"),
    }

    let capabilities = check_capabilities();
    println!();
    print_capability_report(&capabilities);

    println!();
    if all_required_available(&capabilities) {
        println!("All required capabilities are available. Spanrec is ready.");
    } else {
        println!("Some required capabilities are missing. See above for fixes.");
    }

    Ok(())
}
