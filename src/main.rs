fn main() {
    appcontrol_lib::run()
}
