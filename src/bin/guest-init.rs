//! PID 1 inside the micro-VM. All logic lives in `hypeman::guestinit`.

fn main() {
    std::process::exit(hypeman::guestinit::run());
}
